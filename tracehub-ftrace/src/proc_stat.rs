// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Parses `/proc/<pid>/stat` (§4.M). The `comm` field is whatever the
//! process named itself via `prctl(PR_SET_NAME)`, truncated to 15 bytes but
//! otherwise unrestricted: it can contain spaces, parens, even newlines. The
//! kernel wraps it in a single pair of parens, so the only robust split is
//! pid before the first `(`, comm spanning from the first `(` to the *last*
//! `)` in the line (parens included), and whitespace-separated fields after
//! that.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProcStatError {
    #[error("missing pid prefix before '('")]
    MissingPid,
    #[error("pid prefix is not a valid integer")]
    InvalidPid,
    #[error("missing closing ')' for comm field")]
    MissingCommTerminator,
}

/// A parsed `/proc/<pid>/stat` line. Only the fields this crate's kmem
/// trigger and process-matching logic need; `rest` holds everything after
/// `comm` unsplit further, since the remaining ~50 fields are positional and
/// callers that need one can index `rest` themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcStat {
    pub pid: i32,
    pub comm: String,
    pub rest: Vec<String>,
}

/// Parses one `/proc/<pid>/stat` line. `raw` is the whole file contents
/// (usually a single line, always ending in `\n` when read from the real
/// kernel, but that trailing newline is irrelevant to parsing here).
pub fn parse_stat(raw: &str) -> Result<ProcStat, ProcStatError> {
    let open = raw.find('(').ok_or(ProcStatError::MissingPid)?;
    let pid_str = raw[..open].trim();
    if pid_str.is_empty() {
        return Err(ProcStatError::MissingPid);
    }
    let pid: i32 = pid_str.parse().map_err(|_| ProcStatError::InvalidPid)?;

    let close = raw.rfind(')').ok_or(ProcStatError::MissingCommTerminator)?;
    if close < open {
        return Err(ProcStatError::MissingCommTerminator);
    }
    let comm = raw[open..=close].to_string();

    let rest = raw[close + 1..].split_whitespace().map(str::to_string).collect();

    Ok(ProcStat { pid, comm, rest })
}
