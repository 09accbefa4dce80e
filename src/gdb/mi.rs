//! Codec for GDB/MI output records: result records (`^done`, `^error`, …),
//! async records (`*stopped`, `=thread-created`, …), stream output and the
//! `(gdb)` prompt. Only the output direction needs parsing; commands are
//! plain lines.

use thiserror::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MiStreamKind {
    /// `~` console output.
    Console,
    /// `@` target output.
    Target,
    /// `&` log output (echoed CLI commands, warnings).
    Log,
}

/// A value on the right-hand side of a `name=value` result. Lists may hold
/// bare values or named results; named items are represented as one-entry
/// tuples.
#[derive(Clone, Debug, PartialEq)]
pub enum MiValue {
    Const(String),
    Tuple(MiResults),
    List(Vec<MiValue>),
}

pub type MiResults = Vec<(String, MiValue)>;

impl MiValue {
    pub fn as_const(&self) -> Option<&str> {
        match self {
            MiValue::Const(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&MiResults> {
        match self {
            MiValue::Tuple(results) => Some(results),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[MiValue]> {
        match self {
            MiValue::List(items) => Some(items),
            _ => None,
        }
    }
}

/// Looks up the first result with the given name.
pub fn find<'a>(results: &'a [(String, MiValue)], name: &str) -> Option<&'a MiValue> {
    results
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value)
}

#[derive(Clone, Debug, PartialEq)]
pub enum MiRecord {
    /// `^class,results`: the synchronous answer to a command.
    Result { class: String, results: MiResults },
    /// `*class,results`: target execution state change.
    ExecAsync { class: String, results: MiResults },
    /// `+class,results`: ongoing-progress notification.
    StatusAsync { class: String, results: MiResults },
    /// `=class,results`: general notification.
    NotifyAsync { class: String, results: MiResults },
    Stream { kind: MiStreamKind, text: String },
    Prompt,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("malformed MI record {line:?}: {reason}")]
pub struct MiParseError {
    pub line: String,
    pub reason: String,
}

pub fn parse_record(line: &str) -> Result<MiRecord, MiParseError> {
    let mut cursor = Cursor::new(line);
    cursor.skip_token();
    let record = match cursor.peek() {
        Some('^') | Some('*') | Some('+') | Some('=') => {
            let sigil = cursor.next_char().unwrap();
            let class = cursor.parse_identifier()?;
            let results = cursor.parse_results()?;
            match sigil {
                '^' => MiRecord::Result { class, results },
                '*' => MiRecord::ExecAsync { class, results },
                '+' => MiRecord::StatusAsync { class, results },
                _ => MiRecord::NotifyAsync { class, results },
            }
        }
        Some('~') | Some('@') | Some('&') => {
            let kind = match cursor.next_char().unwrap() {
                '~' => MiStreamKind::Console,
                '@' => MiStreamKind::Target,
                _ => MiStreamKind::Log,
            };
            let text = cursor.parse_cstring()?;
            MiRecord::Stream { kind, text }
        }
        Some('(') => MiRecord::Prompt,
        _ => return Err(cursor.error("unrecognized record sigil")),
    };
    Ok(record)
}

struct Cursor<'a> {
    line: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(line: &'a str) -> Cursor<'a> {
        Cursor {
            line,
            chars: line.trim_end().chars().collect(),
            pos: 0,
        }
    }

    fn error(&self, reason: &str) -> MiParseError {
        MiParseError {
            line: self.line.trim_end().to_owned(),
            reason: format!("{} at offset {}", reason, self.pos),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn next_char(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Commands may carry a numeric token prefix; we never use them.
    fn skip_token(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
    }

    fn parse_identifier(&mut self) -> Result<String, MiParseError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.error("expected identifier"));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn parse_results(&mut self) -> Result<MiResults, MiParseError> {
        let mut results = MiResults::new();
        while self.eat(',') {
            results.push(self.parse_named_result()?);
        }
        if self.peek().is_some() {
            return Err(self.error("trailing input after results"));
        }
        Ok(results)
    }

    fn parse_named_result(&mut self) -> Result<(String, MiValue), MiParseError> {
        let name = self.parse_identifier()?;
        if !self.eat('=') {
            return Err(self.error("expected `=`"));
        }
        let value = self.parse_value()?;
        Ok((name, value))
    }

    fn parse_value(&mut self) -> Result<MiValue, MiParseError> {
        match self.peek() {
            Some('"') => Ok(MiValue::Const(self.parse_cstring()?)),
            Some('{') => {
                self.pos += 1;
                let mut results = MiResults::new();
                if !self.eat('}') {
                    loop {
                        results.push(self.parse_named_result()?);
                        if self.eat('}') {
                            break;
                        }
                        if !self.eat(',') {
                            return Err(self.error("expected `,` or `}` in tuple"));
                        }
                    }
                }
                Ok(MiValue::Tuple(results))
            }
            Some('[') => {
                self.pos += 1;
                let mut items = Vec::new();
                if !self.eat(']') {
                    loop {
                        let item = match self.peek() {
                            Some('"') | Some('{') | Some('[') => self.parse_value()?,
                            _ => {
                                let (name, value) = self.parse_named_result()?;
                                MiValue::Tuple(vec![(name, value)])
                            }
                        };
                        items.push(item);
                        if self.eat(']') {
                            break;
                        }
                        if !self.eat(',') {
                            return Err(self.error("expected `,` or `]` in list"));
                        }
                    }
                }
                Ok(MiValue::List(items))
            }
            _ => Err(self.error("expected value")),
        }
    }

    fn parse_cstring(&mut self) -> Result<String, MiParseError> {
        if !self.eat('"') {
            return Err(self.error("expected `\"`"));
        }
        let mut text = String::new();
        loop {
            match self.next_char() {
                None => return Err(self.error("unterminated string")),
                Some('"') => return Ok(text),
                Some('\\') => match self.next_char() {
                    None => return Err(self.error("unterminated escape")),
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('r') => text.push('\r'),
                    Some(other) => text.push(other),
                },
                Some(c) => text.push(c),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_breakpoint_result_record() {
        let record = parse_record(
            r#"^done,bkpt={number="2",type="breakpoint",addr="0x000000000040123a",thread="1"}"#,
        )
        .unwrap();
        match record {
            MiRecord::Result { class, results } => {
                assert_eq!(class, "done");
                let bkpt = find(&results, "bkpt").unwrap().as_tuple().unwrap().to_vec();
                assert_eq!(find(&bkpt, "number").unwrap().as_const(), Some("2"));
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn parses_a_stopped_exec_async_record() {
        let record = parse_record(
            r#"*stopped,reason="breakpoint-hit",disp="keep",bkptno="3",frame={addr="0x0000000000401260",func="main"},thread-id="1",stopped-threads="all""#,
        )
        .unwrap();
        match record {
            MiRecord::ExecAsync { class, results } => {
                assert_eq!(class, "stopped");
                assert_eq!(find(&results, "reason").unwrap().as_const(), Some("breakpoint-hit"));
                assert_eq!(find(&results, "bkptno").unwrap().as_const(), Some("3"));
                let frame = find(&results, "frame").unwrap().as_tuple().unwrap().to_vec();
                assert_eq!(
                    find(&frame, "addr").unwrap().as_const(),
                    Some("0x0000000000401260")
                );
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn parses_notify_stream_and_prompt_records() {
        assert_eq!(
            parse_record(r#"=thread-created,id="2",group-id="i1""#).unwrap(),
            MiRecord::NotifyAsync {
                class: "thread-created".to_owned(),
                results: vec![
                    ("id".to_owned(), MiValue::Const("2".to_owned())),
                    ("group-id".to_owned(), MiValue::Const("i1".to_owned())),
                ],
            }
        );
        assert_eq!(
            parse_record(r#"~"Breakpoint 1 at 0x40123a\n""#).unwrap(),
            MiRecord::Stream {
                kind: MiStreamKind::Console,
                text: "Breakpoint 1 at 0x40123a\n".to_owned(),
            }
        );
        assert_eq!(parse_record("(gdb) ").unwrap(), MiRecord::Prompt);
    }

    #[test]
    fn parses_a_frame_list_with_named_items() {
        let record = parse_record(
            r#"^done,stack=[frame={level="0",addr="0x4011f0"},frame={level="1",addr="0x401260"}]"#,
        )
        .unwrap();
        match record {
            MiRecord::Result { results, .. } => {
                let stack = find(&results, "stack").unwrap().as_list().unwrap().to_vec();
                assert_eq!(stack.len(), 2);
                let first = stack[0].as_tuple().unwrap();
                let frame = find(first, "frame").unwrap().as_tuple().unwrap().to_vec();
                assert_eq!(find(&frame, "level").unwrap().as_const(), Some("0"));
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn parses_an_error_result_and_rejects_garbage() {
        let record = parse_record(r#"^error,msg="No symbol \"counter\" in current context.""#).unwrap();
        match record {
            MiRecord::Result { class, results } => {
                assert_eq!(class, "error");
                assert_eq!(
                    find(&results, "msg").unwrap().as_const(),
                    Some("No symbol \"counter\" in current context.")
                );
            }
            other => panic!("unexpected record: {:?}", other),
        }
        assert!(parse_record("!nonsense").is_err());
        assert!(parse_record(r#"*stopped,reason="#).is_err());
    }
}
