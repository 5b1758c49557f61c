// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `#[derive(TransferHandles)]`: generates `tracehub_ipc::handles::TransferHandles`
//! impls for request/reply enums and structs whose fields may carry a
//! `PlatformHandle<T>` that needs to move out-of-band over `SCM_RIGHTS`
//! rather than serialize inline.
//!
//! A field tagged `#[handle]` is moved/received via the transport; every
//! other field is recursed into so nested messages compose.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Fields, Index};

#[proc_macro_derive(TransferHandles, attributes(handle))]
pub fn derive_transfer_handles(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let (move_body, receive_body) = match &input.data {
        Data::Struct(data) => {
            let (mv, rv) = field_bodies(&data.fields, None);
            (mv, rv)
        }
        Data::Enum(data) => {
            let mut move_arms = Vec::new();
            let mut receive_arms = Vec::new();
            for variant in &data.variants {
                let vname = &variant.ident;
                let (mv, rv) = field_bodies(&variant.fields, Some(vname));
                move_arms.push(quote! { #name::#vname #mv });
                receive_arms.push(quote! { #name::#vname #rv });
            }
            (
                quote! { match self { #(#move_arms)* } },
                quote! { match self { #(#receive_arms)* } },
            )
        }
        Data::Union(_) => {
            return syn::Error::new_spanned(name, "TransferHandles cannot be derived for unions")
                .to_compile_error()
                .into()
        }
    };

    let expanded = quote! {
        impl #impl_generics tracehub_ipc::handles::TransferHandles for #name #ty_generics #where_clause {
            fn move_handles<Transport: tracehub_ipc::handles::HandlesTransport>(
                &self,
                transport: &mut Transport,
            ) -> Result<(), Transport::Error> {
                #move_body
                Ok(())
            }

            fn receive_handles<Transport: tracehub_ipc::handles::HandlesTransport>(
                &mut self,
                transport: &mut Transport,
            ) -> Result<(), Transport::Error> {
                #receive_body
                Ok(())
            }
        }
    };
    expanded.into()
}

/// Builds the struct/variant-matching pattern plus move/receive statement
/// bodies for one set of fields. Returns `(move_pattern_with_body,
/// receive_pattern_with_body)`; for a bare struct (no enum variant) the
/// "pattern" degenerates to a plain block against `self`/`*self`.
fn field_bodies(
    fields: &Fields,
    variant: Option<&syn::Ident>,
) -> (proc_macro2::TokenStream, proc_macro2::TokenStream) {
    match fields {
        Fields::Named(named) => {
            let idents: Vec<_> = named.named.iter().map(|f| f.ident.clone().unwrap()).collect();
            let is_handle: Vec<bool> = named
                .named
                .iter()
                .map(|f| f.attrs.iter().any(|a| a.path().is_ident("handle")))
                .collect();
            let move_stmts = idents.iter().zip(&is_handle).map(|(id, handle)| {
                if *handle {
                    quote! { transport.move_handle(#id)?; }
                } else {
                    quote! { tracehub_ipc::handles::TransferHandles::move_handles(#id, transport)?; }
                }
            });
            let receive_stmts = idents.iter().zip(&is_handle).map(|(id, handle)| {
                if *handle {
                    quote! { *#id = transport.provide_handle(#id)?; }
                } else {
                    quote! { tracehub_ipc::handles::TransferHandles::receive_handles(#id, transport)?; }
                }
            });
            if let Some(v) = variant {
                (
                    quote! { { #(#idents),* } => { #(#move_stmts)* } },
                    quote! { { #(#idents),* } => { #(#receive_stmts)* } },
                )
            } else {
                (
                    quote! { { let Self { #(#idents),* } = self; #(#move_stmts)* } },
                    quote! { { let Self { #(#idents),* } = self; #(#receive_stmts)* } },
                )
            }
        }
        Fields::Unnamed(unnamed) => {
            let binds: Vec<_> = (0..unnamed.unnamed.len())
                .map(|i| syn::Ident::new(&format!("field_{i}"), proc_macro2::Span::call_site()))
                .collect();
            let is_handle: Vec<bool> = unnamed
                .unnamed
                .iter()
                .map(|f| f.attrs.iter().any(|a| a.path().is_ident("handle")))
                .collect();
            let move_stmts = binds.iter().zip(&is_handle).map(|(id, handle)| {
                if *handle {
                    quote! { transport.move_handle(#id)?; }
                } else {
                    quote! { tracehub_ipc::handles::TransferHandles::move_handles(#id, transport)?; }
                }
            });
            let receive_stmts = binds.iter().zip(&is_handle).map(|(id, handle)| {
                if *handle {
                    quote! { *#id = transport.provide_handle(#id)?; }
                } else {
                    quote! { tracehub_ipc::handles::TransferHandles::receive_handles(#id, transport)?; }
                }
            });
            if let Some(_v) = variant {
                (
                    quote! { ( #(#binds),* ) => { #(#move_stmts)* } },
                    quote! { ( #(#binds),* ) => { #(#receive_stmts)* } },
                )
            } else {
                let idx: Vec<Index> = (0..unnamed.unnamed.len()).map(Index::from).collect();
                (
                    quote! { { #(let #binds = &self.#idx;)* #(#move_stmts)* } },
                    quote! { { #(let #binds = &mut self.#idx;)* #(#receive_stmts)* } },
                )
            }
        }
        Fields::Unit => {
            if variant.is_some() {
                (quote! { => {} }, quote! { => {} })
            } else {
                (quote! { {} }, quote! { {} })
            }
        }
    }
}
