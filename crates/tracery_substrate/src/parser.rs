//! Incremental parser for the substrate's textual log stream.
//!
//! QEMU user-mode with `-d strace,exec` interleaves two line shapes:
//!
//! ```text
//! Trace 0: 0x7f81e40 [00000000/0000000000401000/0x13]
//! 12345 read(0,0x40007ff000,128) = 5
//! ```
//!
//! The syscall argument list is delicate: the `)` terminator can and does
//! appear inside a struct-valued argument, so an argument list is accepted
//! only once `(`/`)` are balanced, buffering further input until balance is
//! achieved. A syscall that blocks (or never returns, like `exit_group`) is
//! logged without its ` = result` tail; the result is appended to the stream
//! once the syscall completes.

use once_cell::sync::Lazy;
use regex::bytes::Regex;
use tracery_core::{CoreError, CoreResult};

static BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Trace [^:\n]*: [^ \n]* \[[^/\n]*/(?P<addr>[^/\n]*)/[^\]\n]*\] \n").unwrap());

static SYSCALL_HEAD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?P<pid>\d+) (?P<name>\w+)\(").unwrap());

static RESULT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r" = (?P<result>[^\n]*)\n").unwrap());

/// One parsed item from the log stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogItem {
    /// An executed basic block
    Block {
        /// Block address
        addr: u64,
    },
    /// A syscall entry
    SyscallEntry {
        /// Reporting pid
        pid: u32,
        /// Syscall name
        name: String,
        /// Top-level-comma-split raw arguments
        args: Vec<String>,
    },
    /// The ` = result` tail of the most recent syscall entry
    SyscallResult {
        /// Parsed return value; `None` when the substrate reported none
        result: Option<i64>,
    },
}

/// Buffered incremental log parser.
///
/// Feed raw chunks with [`LogParser::feed`], then drain items. A `None`
/// return means the buffer holds no complete item yet.
#[derive(Debug, Default)]
pub struct LogParser {
    buf: Vec<u8>,
}

impl LogParser {
    /// Create an empty parser
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw chunk from the log stream
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes currently buffered but not yet consumed
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Try to parse the next basic block or syscall entry.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ParseError` if a matched item cannot be decoded.
    pub fn try_event(&mut self) -> CoreResult<Option<LogItem>> {
        let block = BLOCK_RE.captures(&self.buf);
        let syscall = SYSCALL_HEAD_RE.captures(&self.buf);

        // Events are ordered in the log; the earliest match wins.
        let block_start = block
            .as_ref()
            .map(|c| c.get(0).map_or(usize::MAX, |m| m.start()));
        let syscall_start = syscall
            .as_ref()
            .map(|c| c.get(0).map_or(usize::MAX, |m| m.start()));

        match (block_start, syscall_start) {
            (Some(b), Some(s)) if b < s => self.take_block(),
            (Some(_), None) => self.take_block(),
            (_, Some(_)) => self.take_syscall_entry(),
            (None, None) => Ok(None),
        }
    }

    /// Try to parse the pending ` = result` tail.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ParseError` if the matched tail cannot be decoded.
    pub fn try_result(&mut self) -> CoreResult<Option<LogItem>> {
        let Some(caps) = RESULT_RE.captures(&self.buf) else {
            return Ok(None);
        };
        let end = caps.get(0).map_or(0, |m| m.end());
        let raw = text(caps.name("result").map_or(&[][..], |m| m.as_bytes()));
        self.buf.drain(..end);

        // "5", "0x2f 0x2f", "-1 errno=11 (Resource temporarily unavailable)"
        let value = raw.split(' ').next().unwrap_or("");
        Ok(Some(LogItem::SyscallResult {
            result: parse_result_value(value),
        }))
    }

    fn take_block(&mut self) -> CoreResult<Option<LogItem>> {
        let caps = BLOCK_RE
            .captures(&self.buf)
            .ok_or_else(|| parse_error("block line vanished"))?;
        let end = caps.get(0).map_or(0, |m| m.end());
        let raw = text(caps.name("addr").map_or(&[][..], |m| m.as_bytes()));
        let addr = parse_hex(&raw).ok_or_else(|| parse_error(&format!("bad block address {raw:?}")))?;
        self.buf.drain(..end);
        Ok(Some(LogItem::Block { addr }))
    }

    fn take_syscall_entry(&mut self) -> CoreResult<Option<LogItem>> {
        let caps = SYSCALL_HEAD_RE
            .captures(&self.buf)
            .ok_or_else(|| parse_error("syscall head vanished"))?;
        let head_end = caps.get(0).map_or(0, |m| m.end());

        // Balance parentheses before accepting the argument list.
        let mut depth = 1usize;
        let mut close = None;
        for (offset, &byte) in self.buf[head_end..].iter().enumerate() {
            match byte {
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        close = Some(head_end + offset);
                        break;
                    }
                }
                _ => {}
            }
        }
        let Some(close) = close else {
            // Unbalanced so far: a struct-valued argument is still streaming.
            return Ok(None);
        };

        let pid: u32 = text(caps.name("pid").map_or(&[][..], |m| m.as_bytes()))
            .parse()
            .map_err(|_| parse_error("bad pid"))?;
        let name = text(caps.name("name").map_or(&[][..], |m| m.as_bytes()));
        let args = split_args(&text(&self.buf[head_end..close]));

        self.buf.drain(..=close);
        Ok(Some(LogItem::SyscallEntry { pid, name, args }))
    }
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn parse_error(message: &str) -> CoreError {
    CoreError::ParseError {
        message: message.to_string(),
    }
}

fn parse_hex(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let raw = raw.strip_prefix("0x").unwrap_or(raw);
    u64::from_str_radix(raw, 16).ok()
}

fn parse_result_value(value: &str) -> Option<i64> {
    if let Some(hex) = value.strip_prefix("0x") {
        return u64::from_str_radix(hex, 16).ok().map(|v| v as i64);
    }
    value.parse::<i64>().ok()
}

/// Split a raw argument list on top-level commas.
///
/// Commas nested inside `()`/`[]`/`{}` or double quotes belong to a single
/// struct-valued argument and do not separate.
#[must_use]
pub fn split_args(raw: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut quoted = false;
    let mut escaped = false;

    for c in raw.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if quoted => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                current.push(c);
                quoted = !quoted;
            }
            '(' | '[' | '{' if !quoted => {
                current.push(c);
                depth += 1;
            }
            ')' | ']' | '}' if !quoted => {
                current.push(c);
                depth -= 1;
            }
            ',' if !quoted && depth == 0 => {
                args.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    args.push(current.trim().to_string());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE: &[u8] = b"Trace 0: 0x7f81e40 [00000000/0000000000401000/0x13] \n\
12345 read(0,0x40007ff000,128) = 5\n";

    #[test]
    fn test_block_line() {
        let mut parser = LogParser::new();
        parser.feed(SAMPLE);
        let item = parser.try_event().unwrap().unwrap();
        assert_eq!(item, LogItem::Block { addr: 0x401000 });
    }

    #[test]
    fn test_syscall_entry_then_result() {
        let mut parser = LogParser::new();
        parser.feed(SAMPLE);
        parser.try_event().unwrap();

        let entry = parser.try_event().unwrap().unwrap();
        assert_eq!(
            entry,
            LogItem::SyscallEntry {
                pid: 12345,
                name: "read".to_string(),
                args: vec!["0".to_string(), "0x40007ff000".to_string(), "128".to_string()],
            }
        );
        let result = parser.try_result().unwrap().unwrap();
        assert_eq!(result, LogItem::SyscallResult { result: Some(5) });
    }

    #[test]
    fn test_paren_balanced_struct_argument() {
        let mut parser = LogParser::new();
        parser.feed(b"77 rt_sigaction(SIGINT,{mask=(SIGTERM,SIGQUIT),flags=0},NULL)");
        // Entry is complete even without a result tail yet.
        let entry = parser.try_event().unwrap().unwrap();
        let LogItem::SyscallEntry { name, args, .. } = entry else {
            panic!("expected syscall entry");
        };
        assert_eq!(name, "rt_sigaction");
        assert_eq!(args[1], "{mask=(SIGTERM,SIGQUIT),flags=0}");
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn test_unbalanced_args_wait_for_more_input() {
        let mut parser = LogParser::new();
        parser.feed(b"77 rt_sigaction(SIGINT,{mask=(SIGTERM,");
        assert_eq!(parser.try_event().unwrap(), None);
        parser.feed(b"SIGQUIT)},NULL) = 0\n");
        assert!(matches!(
            parser.try_event().unwrap(),
            Some(LogItem::SyscallEntry { .. })
        ));
        assert_eq!(
            parser.try_result().unwrap(),
            Some(LogItem::SyscallResult { result: Some(0) })
        );
    }

    #[test]
    fn test_blocked_syscall_has_no_result_yet() {
        let mut parser = LogParser::new();
        parser.feed(b"99 read(0,0x1000,16)");
        let entry = parser.try_event().unwrap().unwrap();
        assert!(matches!(entry, LogItem::SyscallEntry { .. }));
        assert_eq!(parser.try_result().unwrap(), None);
        // The tail arrives once the target is unblocked.
        parser.feed(b" = 3\n");
        assert_eq!(
            parser.try_result().unwrap(),
            Some(LogItem::SyscallResult { result: Some(3) })
        );
    }

    #[test]
    fn test_negative_and_hex_results() {
        let mut parser = LogParser::new();
        parser.feed(b"1 brk(NULL) = 0x40006000\n");
        parser.try_event().unwrap();
        assert_eq!(
            parser.try_result().unwrap(),
            Some(LogItem::SyscallResult { result: Some(0x4000_6000) })
        );

        parser.feed(b"1 read(5,0x0,1) = -1 errno=9 (Bad file descriptor)\n");
        parser.try_event().unwrap();
        assert_eq!(
            parser.try_result().unwrap(),
            Some(LogItem::SyscallResult { result: Some(-1) })
        );
    }

    #[test]
    fn test_split_args_quoted_comma() {
        assert_eq!(
            split_args("1,\"hi, world\",9"),
            vec!["1".to_string(), "\"hi, world\"".to_string(), "9".to_string()]
        );
        assert_eq!(split_args(""), vec![String::new()]);
    }

    #[test]
    fn test_event_ordering_is_positional() {
        let mut parser = LogParser::new();
        parser.feed(b"5 write(1,0x2000,3) = 3\nTrace 0: 0x1 [0/2000/0x3] \n");
        assert!(matches!(
            parser.try_event().unwrap(),
            Some(LogItem::SyscallEntry { .. })
        ));
        parser.try_result().unwrap();
        assert_eq!(parser.try_event().unwrap(), Some(LogItem::Block { addr: 0x2000 }));
    }

    proptest! {
        // Chunking must never change the parsed item sequence.
        #[test]
        fn prop_chunk_split_invariance(split in 1usize..SAMPLE.len()) {
            let mut whole = LogParser::new();
            whole.feed(SAMPLE);
            let mut split_parser = LogParser::new();
            split_parser.feed(&SAMPLE[..split]);
            split_parser.feed(&SAMPLE[split..]);

            for parser in [&mut whole, &mut split_parser] {
                prop_assert_eq!(parser.try_event().unwrap(), Some(LogItem::Block { addr: 0x401000 }));
            }
            let a = (whole.try_event().unwrap(), whole.try_result().unwrap());
            let b = (split_parser.try_event().unwrap(), split_parser.try_result().unwrap());
            prop_assert_eq!(a, b);
        }
    }
}
