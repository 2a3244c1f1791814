//! Argument-vector cursor for the FT.* parsers. Arguments arrive from the
//! host as raw byte strings; keywords compare case-insensitively, values
//! parse on demand with positional errors.

use fletch::{Result, UserError};

pub struct ArgsIterator<'a> {
    args: &'a [Vec<u8>],
    position: usize,
}

impl<'a> ArgsIterator<'a> {
    pub fn new(args: &'a [Vec<u8>]) -> Self {
        ArgsIterator { args, position: 0 }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.args.len() - self.position
    }

    pub fn done(&self) -> bool {
        self.position >= self.args.len()
    }

    pub fn peek_str(&self) -> Option<&'a str> {
        self.args.get(self.position).and_then(|a| std::str::from_utf8(a).ok())
    }

    pub fn next_bytes(&mut self) -> Result<&'a [u8]> {
        let arg = self.args.get(self.position).ok_or_else(|| {
            UserError::InvalidQuerySyntax(format!(
                "Missing argument at position {}",
                self.position + 1
            ))
        })?;
        self.position += 1;
        Ok(arg)
    }

    pub fn next_str(&mut self) -> Result<&'a str> {
        let position = self.position;
        let bytes = self.next_bytes()?;
        std::str::from_utf8(bytes).map_err(|_| {
            UserError::InvalidQuerySyntax(format!(
                "Argument at position {} is not valid UTF-8",
                position + 1
            ))
            .into()
        })
    }

    pub fn next_u64(&mut self, what: &str) -> Result<u64> {
        let value = self.next_str()?;
        value.parse().map_err(|_| {
            UserError::InvalidQuerySyntax(format!("{what} must be a non-negative integer")).into()
        })
    }

    pub fn next_usize(&mut self, what: &str) -> Result<usize> {
        Ok(self.next_u64(what)? as usize)
    }

    /// Consumes the next argument if it equals `keyword` (ASCII
    /// case-insensitive).
    pub fn match_keyword(&mut self, keyword: &str) -> bool {
        match self.peek_str() {
            Some(arg) if arg.eq_ignore_ascii_case(keyword) => {
                self.position += 1;
                true
            }
            _ => false,
        }
    }

    pub fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        if self.match_keyword(keyword) {
            Ok(())
        } else {
            Err(UserError::InvalidQuerySyntax(format!(
                "Expected `{keyword}` at position {}",
                self.position + 1
            ))
            .into())
        }
    }
}

/// Builds an argument vector from string literals; test shorthand.
pub fn argv(args: &[&str]) -> Vec<Vec<u8>> {
    args.iter().map(|a| a.as_bytes().to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_basics() {
        let args = argv(&["LIMIT", "0", "10", "nocontent"]);
        let mut itr = ArgsIterator::new(&args);
        assert!(itr.match_keyword("limit"));
        assert_eq!(itr.next_u64("offset").unwrap(), 0);
        assert_eq!(itr.next_u64("count").unwrap(), 10);
        assert!(itr.match_keyword("NOCONTENT"));
        assert!(itr.done());
        assert!(itr.next_str().is_err());
    }

    #[test]
    fn keyword_mismatch_leaves_position() {
        let args = argv(&["RETURN", "1"]);
        let mut itr = ArgsIterator::new(&args);
        assert!(!itr.match_keyword("LIMIT"));
        assert_eq!(itr.position(), 0);
        assert!(itr.expect_keyword("RETURN").is_ok());
        assert!(itr.expect_keyword("AS").is_err());
    }
}
