//! Manifest parser
//!
//! A recursive-descent parser for the manifest DSL. A manifest is a sequence
//! of declarations and contexts:
//!
//! ```text
//! # items, optionally tagged
//! dir/project-a (project, git, priority: 3)
//!
//! # item sets over implicit tag sets
//! active = project & git
//!
//! # contexts attach semantics to their body
//! @uris (local: /home/user/dev) {
//!   dir/project-b (project)
//! }
//! ```
//!
//! Tag and option lists are `name` or `name: value` pairs separated by commas
//! and/or newlines; values run to the next delimiter, or are quoted. `#`
//! starts a comment to end of line.

use super::ast::{Document, KvPair, Node, SetExpr, SetOp};
use crate::errors::{LimarError, Result};

pub fn parse(source: &str) -> Result<Document> {
    let mut parser = Parser::new(source);
    let nodes = parser.parse_nodes(false)?;
    Ok(Document { nodes })
}

/// Parse a standalone item-set expression
pub fn parse_expr(source: &str) -> Result<SetExpr> {
    let mut parser = Parser::new(source);
    parser.skip_inline_ws();
    let expr = parser.parse_set_expr()?;
    parser.skip_trivia();
    if let Some(c) = parser.peek() {
        return Err(parser.error(format!(
            "unexpected character '{c}' after item-set expression"
        )));
    }
    Ok(expr)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
    line: usize,
}

impl Parser {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
        }
    }

    fn parse_nodes(&mut self, in_context: bool) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        loop {
            self.skip_trivia();
            match self.peek() {
                None => {
                    if in_context {
                        return Err(self.error("unexpected end of input: unclosed context"));
                    }
                    return Ok(nodes);
                }
                Some('}') => {
                    if in_context {
                        self.bump();
                        return Ok(nodes);
                    }
                    return Err(self.error("unexpected '}' outside a context"));
                }
                Some('@') => nodes.push(self.parse_context()?),
                Some(c) if is_ident_char(c) => nodes.push(self.parse_declaration()?),
                Some(c) => return Err(self.error(format!("unexpected character '{c}'"))),
            }
        }
    }

    fn parse_declaration(&mut self) -> Result<Node> {
        let ref_name = self.parse_ident()?;
        self.skip_inline_ws();

        match self.peek() {
            Some('=') => {
                self.bump();
                self.skip_inline_ws();
                let expr = self.parse_set_expr()?;
                Ok(Node::ItemSet { ref_name, expr })
            }
            Some('(') => {
                let tags = self.parse_kv_list()?;
                Ok(Node::Item { ref_name, tags })
            }
            _ => Ok(Node::Item {
                ref_name,
                tags: Vec::new(),
            }),
        }
    }

    fn parse_context(&mut self) -> Result<Node> {
        self.bump(); // '@'
        let context_type = self.parse_ident()?;
        self.skip_inline_ws();

        let opts = if self.peek() == Some('(') {
            self.parse_kv_list()?
        } else {
            Vec::new()
        };

        self.skip_trivia();
        if self.peek() != Some('{') {
            return Err(self.error(format!(
                "expected '{{' to open the body of context '@{context_type}'"
            )));
        }
        self.bump();

        let body = self.parse_nodes(true)?;
        Ok(Node::Context {
            context_type,
            opts,
            body,
        })
    }

    /// Parse a parenthesised `name` / `name: value` list (tags or options)
    fn parse_kv_list(&mut self) -> Result<Vec<KvPair>> {
        self.bump(); // '('
        let mut pairs = Vec::new();

        loop {
            self.skip_separators();
            match self.peek() {
                None => return Err(self.error("unexpected end of input: unclosed list")),
                Some(')') => {
                    self.bump();
                    return Ok(pairs);
                }
                Some(c) if is_ident_char(c) => {
                    let name = self.parse_ident()?;
                    self.skip_inline_ws();

                    let value = if self.peek() == Some(':') {
                        self.bump();
                        self.skip_inline_ws();
                        Some(self.parse_value(&[',', ')', '\n'])?)
                    } else {
                        None
                    };
                    pairs.push((name, value));
                }
                Some(c) => {
                    return Err(self.error(format!("unexpected character '{c}' in list")))
                }
            }
        }
    }

    /// Parse a value: quoted, or raw text up to one of the delimiters
    fn parse_value(&mut self, delimiters: &[char]) -> Result<String> {
        if let Some(quote) = self.peek().filter(|c| *c == '"' || *c == '\'') {
            self.bump();
            let mut value = String::new();
            loop {
                match self.bump() {
                    None => return Err(self.error("unexpected end of input: unclosed quote")),
                    Some(c) if c == quote => return Ok(value),
                    Some('\n') => {
                        return Err(self.error("unexpected end of line inside quoted value"))
                    }
                    Some(c) => value.push(c),
                }
            }
        }

        let mut value = String::new();
        while let Some(c) = self.peek() {
            if delimiters.contains(&c) {
                break;
            }
            value.push(c);
            self.bump();
        }
        Ok(value.trim_end().to_string())
    }

    /// Parse an item-set expression: operands joined by `&`/`|`, left
    /// associative, with parenthesised subexpressions
    fn parse_set_expr(&mut self) -> Result<SetExpr> {
        let mut expr = self.parse_set_operand()?;

        loop {
            self.skip_inline_ws();
            let op = match self.peek() {
                Some('&') => SetOp::And,
                Some('|') => SetOp::Or,
                _ => return Ok(expr),
            };
            self.bump();
            self.skip_inline_ws();

            let right = self.parse_set_operand()?;
            expr = SetExpr::Op {
                op,
                left: Box::new(expr),
                right: Box::new(right),
            };
        }
    }

    fn parse_set_operand(&mut self) -> Result<SetExpr> {
        match self.peek() {
            Some('(') => {
                self.bump();
                self.skip_inline_ws();
                let expr = self.parse_set_expr()?;
                self.skip_inline_ws();
                if self.peek() != Some(')') {
                    return Err(self.error("expected ')' to close subexpression"));
                }
                self.bump();
                Ok(expr)
            }
            Some(c) if is_ident_char(c) => {
                let name = self.parse_ident()?;
                // A tag with a value is treated the same as its bare name
                if self.peek() == Some(':') {
                    self.bump();
                    self.skip_inline_ws();
                    self.parse_value(&[' ', '\t', ')', '\n'])?;
                }
                Ok(SetExpr::Operand(name))
            }
            Some(c) => Err(self.error(format!(
                "unexpected character '{c}' in item-set expression"
            ))),
            None => Err(self.error("unexpected end of input in item-set expression")),
        }
    }

    fn parse_ident(&mut self) -> Result<String> {
        let mut ident = String::new();
        while let Some(c) = self.peek() {
            if !is_ident_char(c) {
                break;
            }
            ident.push(c);
            self.bump();
        }

        if ident.is_empty() {
            return Err(self.error("expected a name"));
        }
        Ok(ident)
    }

    // Trivia
    // --------------------

    fn skip_inline_ws(&mut self) {
        while matches!(self.peek(), Some(' ') | Some('\t')) {
            self.bump();
        }
    }

    /// Skip whitespace, newlines, and comments
    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(' ') | Some('\t') | Some('\n') | Some('\r') => {
                    self.bump();
                }
                Some('#') => self.skip_comment(),
                _ => return,
            }
        }
    }

    /// Skip trivia plus the `,` separators of tag/option lists
    fn skip_separators(&mut self) {
        loop {
            match self.peek() {
                Some(' ') | Some('\t') | Some('\n') | Some('\r') | Some(',') => {
                    self.bump();
                }
                Some('#') => self.skip_comment(),
                _ => return,
            }
        }
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                return;
            }
            self.bump();
        }
    }

    // Low-level
    // --------------------

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied();
        if let Some(c) = c {
            self.pos += 1;
            if c == '\n' {
                self.line += 1;
            }
        }
        c
    }

    fn error(&self, message: impl std::fmt::Display) -> LimarError {
        LimarError::manifest(format!("line {}: {message}", self.line))
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ast::{Node, SetExpr, SetOp};

    fn operand(name: &str) -> SetExpr {
        SetExpr::Operand(name.to_string())
    }

    #[test]
    fn test_items_with_and_without_tags() -> anyhow::Result<()> {
        let doc = parse("a (x, y)\nb (y)\nplain\n")?;

        assert_eq!(doc.nodes.len(), 3);
        assert_eq!(
            doc.nodes[0],
            Node::Item {
                ref_name: "a".to_string(),
                tags: vec![("x".to_string(), None), ("y".to_string(), None)],
            }
        );
        assert_eq!(
            doc.nodes[2],
            Node::Item {
                ref_name: "plain".to_string(),
                tags: vec![],
            }
        );
        Ok(())
    }

    #[test]
    fn test_tag_values_and_multiline_lists() -> anyhow::Result<()> {
        let doc = parse("tool-git (\n  tool: git\n  priority: 3, hidden\n)\n")?;

        let Node::Item { tags, .. } = &doc.nodes[0] else {
            panic!("expected item");
        };
        assert_eq!(
            tags,
            &vec![
                ("tool".to_string(), Some("git".to_string())),
                ("priority".to_string(), Some("3".to_string())),
                ("hidden".to_string(), None),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_quoted_values_keep_delimiters() -> anyhow::Result<()> {
        let doc = parse("q (command: \"echo a, b (c)\", parse: .)\n")?;

        let Node::Item { tags, .. } = &doc.nodes[0] else {
            panic!("expected item");
        };
        assert_eq!(tags[0].1.as_deref(), Some("echo a, b (c)"));
        assert_eq!(tags[1].1.as_deref(), Some("."));
        Ok(())
    }

    #[test]
    fn test_item_set_expressions() -> anyhow::Result<()> {
        let doc = parse("s = x & y\ns2 = x | y & z\ns3 = (x | y) & z\n")?;

        assert_eq!(
            doc.nodes[0],
            Node::ItemSet {
                ref_name: "s".to_string(),
                expr: SetExpr::Op {
                    op: SetOp::And,
                    left: Box::new(operand("x")),
                    right: Box::new(operand("y")),
                },
            }
        );

        // Left associative, equal precedence
        assert_eq!(
            doc.nodes[1],
            Node::ItemSet {
                ref_name: "s2".to_string(),
                expr: SetExpr::Op {
                    op: SetOp::And,
                    left: Box::new(SetExpr::Op {
                        op: SetOp::Or,
                        left: Box::new(operand("x")),
                        right: Box::new(operand("y")),
                    }),
                    right: Box::new(operand("z")),
                },
            }
        );
        assert_eq!(doc.nodes[1], doc.nodes[2].clone_with_ref("s2"));
        Ok(())
    }

    #[test]
    fn test_contexts_nest() -> anyhow::Result<()> {
        let doc = parse(
            "@uris (local: /home/user) {\n  a (project)\n  @tags (git) {\n    b\n  }\n}\n",
        )?;

        let Node::Context {
            context_type,
            opts,
            body,
        } = &doc.nodes[0]
        else {
            panic!("expected context");
        };
        assert_eq!(context_type, "uris");
        assert_eq!(
            opts,
            &vec![("local".to_string(), Some("/home/user".to_string()))]
        );
        assert_eq!(body.len(), 2);
        assert!(matches!(&body[1], Node::Context { body, .. } if body.len() == 1));
        Ok(())
    }

    #[test]
    fn test_comments_ignored() -> anyhow::Result<()> {
        let doc = parse("# header\na (x)\n# middle\nb\n")?;
        assert_eq!(doc.nodes.len(), 2);
        Ok(())
    }

    #[test]
    fn test_parse_errors_carry_line_numbers() {
        let err = parse("a (x\n").unwrap_err();
        assert!(err.to_string().contains("line 2"), "got: {err}");

        assert!(parse("@ctx (a) {\n  b\n").is_err());
        assert!(parse("s = x &\n").is_err());
    }

    #[test]
    fn test_format_parse_round_trip() -> anyhow::Result<()> {
        let source = "\
a (x, y)
b (y, priority: 3)
s = x & y
s2 = (x | y) & s
@uris (local: /home/user, remote: https://example.com/u) {
  dir/proj-1 (project)
  @tags (git) {
    dir/proj-2 (note: \"has, delimiters\")
  }
}
";
        let doc = parse(source)?;
        let reparsed = parse(&doc.to_string())?;
        assert_eq!(doc, reparsed);
        Ok(())
    }

    impl Node {
        /// Test helper: compare two nodes ignoring the declared ref name
        fn clone_with_ref(&self, new_ref: &str) -> Node {
            match self {
                Node::ItemSet { expr, .. } => Node::ItemSet {
                    ref_name: new_ref.to_string(),
                    expr: expr.clone(),
                },
                other => other.clone(),
            }
        }
    }
}
