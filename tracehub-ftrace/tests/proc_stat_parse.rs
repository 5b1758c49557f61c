// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! §8 scenario 8: parsing `/proc/<pid>/stat` content whose `comm` field
//! itself contains a parenthesized group.

use tracehub_ftrace::parse_stat;

#[test]
fn comm_containing_a_nested_parenthesized_group_keeps_its_outer_parens() {
    let stat = parse_stat("123 (a) (b) R 5 6").unwrap();
    assert_eq!(stat.pid, 123);
    assert_eq!(stat.comm, "(a) (b)");
    assert_eq!(stat.rest, vec!["R", "5", "6"]);
}
