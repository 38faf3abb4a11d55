//! Decoders for Valve Data File payloads received from the Steam CM.
//!
//! Two dialects are used by PICS product info: text VDF for app info and
//! binary (tag-length-value) VDF for package info. Both decoders are
//! tolerant: malformed trailing data ends the parse instead of failing it,
//! matching how Steam clients treat these blobs.

use std::collections::HashMap;

/// A parsed VDF node: string attributes, int attributes (binary dialect
/// only) and named child nodes.
#[derive(Debug, Default, Clone)]
pub struct Node {
    pub str_attrs: HashMap<String, String>,
    pub int_attrs: HashMap<String, i32>,
    pub children: HashMap<String, Node>,
}

impl Node {
    /// Looks up a child node by name.
    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.get(name)
    }

    /// Looks up a string attribute by name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.str_attrs.get(name).map(String::as_str)
    }
}

// =============================================================================
// Text VDF
// =============================================================================

/// Parses a text VDF document and returns its root node.
///
/// The document has the form `"name" { ... }`; the returned node is the
/// body of that single root object. Returns `None` when not even a root
/// object can be read.
pub fn parse_text(input: &str) -> Option<Node> {
    let mut lexer = Lexer { rest: input };
    let Token::Str(_root_name) = lexer.next_token()? else {
        return None;
    };
    if !matches!(lexer.next_token()?, Token::Open) {
        return None;
    }
    Some(parse_text_body(&mut lexer))
}

enum Token {
    Str(String),
    Open,
    Close,
}

struct Lexer<'a> {
    rest: &'a str,
}

impl Lexer<'_> {
    fn next_token(&mut self) -> Option<Token> {
        self.rest = self.rest.trim_start();
        // Skip comment lines
        while let Some(rest) = self.rest.strip_prefix("//") {
            self.rest = rest.split_once('\n').map_or("", |(_, tail)| tail);
            self.rest = self.rest.trim_start();
        }
        let mut chars = self.rest.char_indices();
        let (_, first) = chars.next()?;
        match first {
            '{' => {
                self.rest = &self.rest[1..];
                Some(Token::Open)
            },
            '}' => {
                self.rest = &self.rest[1..];
                Some(Token::Close)
            },
            '"' => {
                let mut value = String::new();
                let mut escaped = false;
                for (idx, ch) in chars {
                    if escaped {
                        value.push(match ch {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                        escaped = false;
                    } else if ch == '\\' {
                        escaped = true;
                    } else if ch == '"' {
                        self.rest = &self.rest[idx + 1..];
                        return Some(Token::Str(value));
                    } else {
                        value.push(ch);
                    }
                }
                // Unterminated string: treat as end of input
                self.rest = "";
                None
            },
            _ => {
                // Bare token (conditionals etc.); read up to whitespace
                let end = self
                    .rest
                    .find(|c: char| c.is_whitespace() || c == '{' || c == '}')
                    .unwrap_or(self.rest.len());
                let value = self.rest[..end].to_owned();
                self.rest = &self.rest[end..];
                Some(Token::Str(value))
            },
        }
    }
}

fn parse_text_body(lexer: &mut Lexer<'_>) -> Node {
    let mut node = Node::default();
    loop {
        let Some(token) = lexer.next_token() else {
            return node;
        };
        let name = match token {
            Token::Close => return node,
            Token::Open => continue, // stray brace, skip
            Token::Str(name) => name,
        };
        match lexer.next_token() {
            Some(Token::Str(value)) => {
                node.str_attrs.insert(name, value);
            },
            Some(Token::Open) => {
                node.children.insert(name, parse_text_body(lexer));
            },
            Some(Token::Close) | None => return node,
        }
    }
}

// =============================================================================
// Binary VDF
// =============================================================================

const BVDF_NODE: u8 = 0x00;
const BVDF_STRING: u8 = 0x01;
const BVDF_INT32: u8 = 0x02;
const BVDF_END: u8 = 0x08;

/// Parses a binary VDF blob into a node tree.
pub fn parse_binary(data: &[u8]) -> Node {
    let mut cur = data;
    parse_binary_node(&mut cur)
}

fn parse_binary_node(cur: &mut &[u8]) -> Node {
    let mut node = Node::default();
    loop {
        let Some((&tag, rest)) = cur.split_first() else {
            return node;
        };
        *cur = rest;
        if tag == BVDF_END {
            return node;
        }
        let Some(name) = take_cstr(cur) else {
            return node;
        };
        match tag {
            BVDF_NODE => {
                let child = parse_binary_node(cur);
                node.children.insert(name, child);
            },
            BVDF_STRING => {
                let Some(value) = take_cstr(cur) else {
                    return node;
                };
                node.str_attrs.insert(name, value);
            },
            BVDF_INT32 => {
                let Some((bytes, rest)) = cur.split_first_chunk::<4>() else {
                    return node;
                };
                *cur = rest;
                node.int_attrs.insert(name, i32::from_le_bytes(*bytes));
            },
            _ => return node,
        }
    }
}

fn take_cstr(cur: &mut &[u8]) -> Option<String> {
    let nul = cur.iter().position(|&b| b == 0)?;
    let value = String::from_utf8_lossy(&cur[..nul]).into_owned();
    *cur = &cur[nul + 1..];
    Some(value)
}
