use super::ParseError;

/// Byte cursor over a SQL text.
///
/// All scanning is byte-based: SQL syntax is ASCII, and multi-byte UTF-8
/// sequences only ever appear inside string literals, comments or
/// identifiers, where they are carried through untouched.
pub(crate) struct Cursor<'a> {
    input: &'a str,
    pos: usize,
}

/// What `skip_ignorable` stepped over.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Ignorable {
    pub skipped: bool,
    pub comment: bool,
}

pub(crate) fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

pub(crate) fn is_ident_part(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

impl<'a> Cursor<'a> {
    pub fn new(input: &'a str) -> Self {
        Cursor { input, pos: 0 }
    }

    pub fn input(&self) -> &'a str {
        self.input
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn set_pos(&mut self, pos: usize) {
        debug_assert!(pos <= self.input.len());
        self.pos = pos;
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    pub fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    pub fn peek_at(&self, offset: usize) -> Option<u8> {
        self.input.as_bytes().get(self.pos + offset).copied()
    }

    pub fn bump(&mut self) -> Option<u8> {
        let b = self.peek();
        if b.is_some() {
            self.pos += 1;
        }
        b
    }

    pub fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(self.pos, message)
    }

    pub fn error_at(&self, pos: usize, message: impl Into<String>) -> ParseError {
        ParseError::new(pos, message)
    }

    /// Skips whitespace and comments. Line comments run to the next LF or
    /// end of input; block comments nest and must be terminated.
    pub fn skip_ignorable(&mut self) -> Result<Ignorable, ParseError> {
        let mut out = Ignorable::default();
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\r' | b'\n') => {
                    self.pos += 1;
                    out.skipped = true;
                }
                Some(b'-') if self.peek_at(1) == Some(b'-') => {
                    self.skip_line_comment();
                    out.skipped = true;
                    out.comment = true;
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    self.skip_block_comment()?;
                    out.skipped = true;
                    out.comment = true;
                }
                _ => return Ok(out),
            }
        }
    }

    fn skip_line_comment(&mut self) {
        debug_assert_eq!(self.peek(), Some(b'-'));
        while let Some(b) = self.peek() {
            self.pos += 1;
            if b == b'\n' {
                break;
            }
        }
    }

    pub fn skip_block_comment(&mut self) -> Result<(), ParseError> {
        debug_assert_eq!(self.peek(), Some(b'/'));
        let open = self.pos;
        self.pos += 2;
        let mut depth = 1usize;
        while depth > 0 {
            match self.peek() {
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    depth += 1;
                    self.pos += 2;
                }
                Some(b'*') if self.peek_at(1) == Some(b'/') => {
                    depth -= 1;
                    self.pos += 2;
                }
                Some(_) => self.pos += 1,
                None => return Err(self.error_at(open, "unterminated block comment")),
            }
        }
        Ok(())
    }

    /// Reads an unquoted word (`[A-Za-z_][A-Za-z0-9_]*`). Returns an empty
    /// slice when the cursor is not at a word start.
    pub fn read_word(&mut self) -> &'a str {
        let start = self.pos;
        if let Some(b) = self.peek() {
            if is_ident_start(b) {
                self.pos += 1;
                while let Some(b) = self.peek() {
                    if is_ident_part(b) {
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
            }
        }
        &self.input[start..self.pos]
    }

    /// Peeks the next word without consuming it.
    pub fn peek_word(&mut self) -> &'a str {
        let save = self.pos;
        let word = self.read_word();
        self.pos = save;
        word
    }

    /// Reads a quoted token delimited by `quote` with doubled-quote escape.
    /// The closing quote must not be immediately followed by an identifier
    /// byte (`'abc'def` is malformed everywhere a token is expected).
    pub fn read_quoted(&mut self, quote: u8) -> Result<String, ParseError> {
        debug_assert_eq!(self.peek(), Some(quote));
        let open = self.pos;
        self.pos += 1;
        let start = self.pos;
        let mut out = String::new();
        loop {
            match self.bump() {
                Some(b) if b == quote => {
                    if self.peek() == Some(quote) {
                        out.push_str(&self.input[start..self.pos - 1]);
                        return self.read_quoted_escaped(quote, open, out);
                    }
                    out.push_str(&self.input[start..self.pos - 1]);
                    if let Some(next) = self.peek() {
                        if is_ident_part(next) {
                            return Err(self.error("missing separator after quoted token"));
                        }
                    }
                    return Ok(out);
                }
                Some(_) => {}
                None => return Err(self.error_at(open, "unterminated string")),
            }
        }
    }

    /// Slow path once a doubled quote has been seen.
    fn read_quoted_escaped(
        &mut self,
        quote: u8,
        open: usize,
        mut out: String,
    ) -> Result<String, ParseError> {
        out.push(quote as char);
        self.pos += 1;
        let mut start = self.pos;
        loop {
            match self.bump() {
                Some(b) if b == quote => {
                    out.push_str(&self.input[start..self.pos - 1]);
                    if self.peek() == Some(quote) {
                        out.push(quote as char);
                        self.pos += 1;
                        start = self.pos;
                        continue;
                    }
                    if let Some(next) = self.peek() {
                        if is_ident_part(next) {
                            return Err(self.error("missing separator after quoted token"));
                        }
                    }
                    return Ok(out);
                }
                Some(_) => {}
                None => return Err(self.error_at(open, "unterminated string")),
            }
        }
    }

    /// Skips a quoted literal without collecting it (used when scanning
    /// opaque statement bodies). No separator rule is applied here.
    pub fn skip_quoted(&mut self, quote: u8) -> Result<(), ParseError> {
        let open = self.pos;
        self.pos += 1;
        loop {
            match self.bump() {
                Some(b) if b == quote => {
                    if self.peek() == Some(quote) {
                        self.pos += 1;
                        continue;
                    }
                    return Ok(());
                }
                Some(_) => {}
                None => return Err(self.error_at(open, "unterminated string")),
            }
        }
    }

    /// Reads the next token: a bare word or a single-/double-quoted string.
    pub fn read_token(&mut self) -> Result<String, ParseError> {
        match self.peek() {
            Some(q @ (b'\'' | b'"')) => self.read_quoted(q),
            Some(b) if is_ident_start(b) => Ok(self.read_word().to_string()),
            _ => Err(self.error("expected identifier or quoted name")),
        }
    }

    /// Skips ignorable bytes and enforces that a separator existed when the
    /// next byte opens a quoted token. A bare word directly following a
    /// keyword would have fused with it, so only quotes need the check.
    pub fn separated_token(&mut self) -> Result<String, ParseError> {
        let ig = self.skip_ignorable()?;
        if !ig.skipped && matches!(self.peek(), Some(b'\'' | b'"')) {
            return Err(self.error("missing separator before quoted token"));
        }
        self.read_token()
    }

    /// Reads a non-negative integer literal, decimal or `0x` hex.
    pub fn read_integer(&mut self) -> Result<i64, ParseError> {
        let start = self.pos;
        if self.peek() == Some(b'0') && matches!(self.peek_at(1), Some(b'x' | b'X')) {
            self.pos += 2;
            let digits_start = self.pos;
            while matches!(self.peek(), Some(b) if b.is_ascii_hexdigit()) {
                self.pos += 1;
            }
            if self.pos == digits_start {
                return Err(self.error_at(start, "malformed hex literal"));
            }
            return i64::from_str_radix(&self.input[digits_start..self.pos], 16)
                .map_err(|_| self.error_at(start, "hex literal out of range"));
        }
        let digits_start = self.pos;
        while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.pos == digits_start {
            return Err(self.error("expected integer"));
        }
        self.input[digits_start..self.pos]
            .parse::<i64>()
            .map_err(|_| self.error_at(start, "integer out of range"))
    }

    /// Consumes a single expected byte.
    pub fn expect_byte(&mut self, b: u8, what: &str) -> Result<(), ParseError> {
        if self.peek() == Some(b) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected '{what}'")))
        }
    }

    /// Consumes the given keyword case-insensitively, failing otherwise.
    /// Word boundary is implicit: a longer word never matches.
    pub fn expect_keyword(&mut self, keyword: &str) -> Result<(), ParseError> {
        let at = self.pos;
        let word = self.read_word();
        if word.eq_ignore_ascii_case(keyword) {
            Ok(())
        } else {
            Err(self.error_at(at, format!("expected {}", keyword.to_ascii_uppercase())))
        }
    }

    /// Consumes the next word when it matches one of `keywords`, returning
    /// the matched entry. The cursor does not move on a miss.
    pub fn take_keyword<'k>(
        &mut self,
        keywords: &[&'k str],
    ) -> Result<Option<&'k str>, ParseError> {
        let save = self.pos;
        self.skip_ignorable()?;
        let word = self.read_word();
        for kw in keywords {
            if word.eq_ignore_ascii_case(kw) {
                return Ok(Some(*kw));
            }
        }
        self.pos = save;
        Ok(None)
    }

    /// Requires the statement to end here: only ignorable bytes may remain
    /// before the top-level `;` or end of input. The terminator itself is
    /// not consumed.
    pub fn expect_statement_end(&mut self) -> Result<(), ParseError> {
        self.skip_ignorable()?;
        match self.peek() {
            None | Some(b';') => Ok(()),
            _ => Err(self.error("unexpected token at end of statement")),
        }
    }

    /// Scans an opaque statement body up to the top-level `;` or end of
    /// input. Strings and comments are skipped as units so embedded
    /// semicolons never terminate the statement.
    pub fn skip_to_statement_end(&mut self) -> Result<(), ParseError> {
        loop {
            match self.peek() {
                None | Some(b';') => return Ok(()),
                Some(b'\'') => self.skip_quoted(b'\'')?,
                Some(b'"') => self.skip_quoted(b'"')?,
                Some(b'-') if self.peek_at(1) == Some(b'-') => {
                    self.skip_ignorable()?;
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    self.skip_ignorable()?;
                }
                _ => {
                    self.pos += 1;
                }
            }
        }
    }

    /// Consumes the next byte when it is a comma, skipping leading
    /// ignorable bytes only when a comma follows them.
    pub fn take_comma(&mut self) -> Result<bool, ParseError> {
        let save = self.pos;
        self.skip_ignorable()?;
        if self.peek() == Some(b',') {
            self.pos += 1;
            Ok(true)
        } else {
            self.pos = save;
            Ok(false)
        }
    }
}

/// Reads `[schema .] name`; whitespace and comments may surround the dot.
pub(crate) fn qualified_name(
    cur: &mut Cursor<'_>,
) -> Result<(Option<String>, String), ParseError> {
    let first = cur.separated_token()?;
    let save = cur.pos();
    cur.skip_ignorable()?;
    if cur.peek() == Some(b'.') {
        cur.bump();
        cur.skip_ignorable()?;
        let second = cur.read_token()?;
        Ok((Some(first), second))
    } else {
        cur.set_pos(save);
        Ok((None, first))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_block_comment() {
        let mut cur = Cursor::new("/*a/*b*/c*/x");
        cur.skip_ignorable().unwrap();
        assert_eq!(cur.peek(), Some(b'x'));
    }

    #[test]
    fn test_unterminated_block_comment() {
        let mut cur = Cursor::new("  /*a/*b*/");
        let err = cur.skip_ignorable().unwrap_err();
        assert_eq!(err.position(), 2);
    }

    #[test]
    fn test_doubled_quote_escape() {
        let mut cur = Cursor::new("'it''s'");
        assert_eq!(cur.read_quoted(b'\'').unwrap(), "it's");
        assert!(cur.at_end());
    }

    #[test]
    fn test_quoted_then_identifier_rejected() {
        let mut cur = Cursor::new("'localhost'IDENTIFIED");
        assert!(cur.read_quoted(b'\'').is_err());
    }

    #[test]
    fn test_backslash_is_not_an_escape() {
        let mut cur = Cursor::new(r"'C:\test.db'");
        assert_eq!(cur.read_quoted(b'\'').unwrap(), r"C:\test.db");
    }

    #[test]
    fn test_read_integer_hex() {
        let mut cur = Cursor::new("0x10");
        assert_eq!(cur.read_integer().unwrap(), 16);
    }
}
