//! Hand-written recursive-descent parser with Pratt precedence for operator
//! expressions.

use std::rc::Rc;

use super::ast::{
    ArrayItem, BinaryOp, CastType, CatchClause, ClassDecl, ClassKind, ClassMember, ClosureDecl,
    ConstDecl, ConstItem, ControlFlow, Expr, FunctionDecl, IncludeKind, MatchArm, MethodDecl, Param,
    PropertyDecl, Span, StaticVar, Stmt, StmtKind, StringPart, SwitchCase, UnaryOp, UseItem,
    Visibility,
};
use super::lexer::{Token, lex, unescape_double, unescape_single};
use crate::error::{Error, Result};

/// Parse a complete program.
pub fn parse(source: &str) -> Result<Vec<Stmt>> {
    Parser::new(source)?.parse_program()
}

/// Parse a single expression (used for `{$...}` string interpolation).
pub fn parse_expression(source: &str) -> Result<Expr> {
    let mut parser = Parser::new(source)?;
    let expr = parser.parse_expr()?;
    if !parser.at_end() {
        return Err(parser.unexpected("end of expression"));
    }
    Ok(expr)
}

const ASSIGN_BP: u8 = 1;
const TERNARY_BP: u8 = 3;
const PREFIX_BP: u8 = 30;
const INSTANCEOF_BP: u8 = 32;

fn infix_bp(token: &Token<'_>) -> Option<(u8, u8, BinaryOp)> {
    let bp = match token {
        Token::Coalesce => (6, 5, BinaryOp::Coalesce),
        Token::OrOr => (7, 8, BinaryOp::Or),
        Token::AndAnd => (9, 10, BinaryOp::And),
        Token::Pipe => (11, 12, BinaryOp::BitOr),
        Token::Ampersand => (13, 14, BinaryOp::BitAnd),
        Token::EqualEqual => (15, 16, BinaryOp::Eq),
        Token::NotEqual => (15, 16, BinaryOp::NotEq),
        Token::Identical => (15, 16, BinaryOp::Identical),
        Token::NotIdentical => (15, 16, BinaryOp::NotIdentical),
        Token::Less => (17, 18, BinaryOp::Lt),
        Token::Greater => (17, 18, BinaryOp::Gt),
        Token::LessEqual => (17, 18, BinaryOp::LtEq),
        Token::GreaterEqual => (17, 18, BinaryOp::GtEq),
        Token::Dot => (19, 20, BinaryOp::Concat),
        Token::Plus => (21, 22, BinaryOp::Add),
        Token::Minus => (21, 22, BinaryOp::Sub),
        Token::Star => (23, 24, BinaryOp::Mul),
        Token::Slash => (23, 24, BinaryOp::Div),
        Token::Percent => (23, 24, BinaryOp::Mod),
        _ => return None,
    };
    Some(bp)
}

fn compound_assign_op(token: &Token<'_>) -> Option<Option<BinaryOp>> {
    match token {
        Token::Equal => Some(None),
        Token::PlusEqual => Some(Some(BinaryOp::Add)),
        Token::MinusEqual => Some(Some(BinaryOp::Sub)),
        Token::StarEqual => Some(Some(BinaryOp::Mul)),
        Token::SlashEqual => Some(Some(BinaryOp::Div)),
        Token::DotEqual => Some(Some(BinaryOp::Concat)),
        _ => None,
    }
}

/// Names that cannot start a plain function call or constant fetch.
const RESERVED: &[&str] = &[
    "abstract", "class", "const", "do", "echo", "else", "elseif", "enum", "final", "for",
    "foreach", "global", "if", "interface", "namespace", "return", "switch", "trait", "try",
    "while",
];

pub struct Parser<'src> {
    source: &'src str,
    tokens: Vec<(Token<'src>, Span)>,
    pos: usize,
}

impl<'src> Parser<'src> {
    pub fn new(source: &'src str) -> Result<Self> {
        Ok(Self {
            source,
            tokens: lex(source)?,
            pos: 0,
        })
    }

    pub fn parse_program(&mut self) -> Result<Vec<Stmt>> {
        let mut stmts = Vec::new();
        while !self.at_end() {
            stmts.push(self.parse_stmt()?);
        }
        Ok(stmts)
    }

    // ── Helpers ──

    fn peek(&self) -> Option<&Token<'src>> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token<'src>> {
        self.tokens.get(self.pos + offset).map(|(t, _)| t)
    }

    fn peek_span(&self) -> Span {
        match self.tokens.get(self.pos) {
            Some((_, span)) => *span,
            None => Span::new(self.source.len(), self.source.len()),
        }
    }

    /// End offset of the most recently consumed token.
    fn last_end(&self) -> usize {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map_or(0, |(_, span)| span.end)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn advance(&mut self) -> Option<(Token<'src>, Span)> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, expected: &Token<'_>) -> bool {
        matches!(
            self.peek(),
            Some(tok) if std::mem::discriminant(tok) == std::mem::discriminant(expected)
        )
    }

    fn eat(&mut self, expected: &Token<'_>) -> bool {
        if self.check(expected) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn expect(&mut self, expected: &Token<'_>, what: &str) -> Result<()> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn check_keyword(&self, kw: &str) -> bool {
        self.peek().is_some_and(|t| t.is_keyword(kw))
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.check_keyword(kw) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<()> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{}'", kw)))
        }
    }

    fn expect_name(&mut self) -> Result<String> {
        match self.peek() {
            Some(Token::Name(name)) => {
                let name = name.to_string();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.unexpected("identifier")),
        }
    }

    fn expect_variable(&mut self) -> Result<String> {
        match self.peek() {
            Some(Token::Variable(name)) => {
                let name = name.to_string();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.unexpected("variable")),
        }
    }

    /// Statement terminator. A missing `;` is tolerated at end of input, so
    /// REPL lines like `$a = 1` evaluate as typed.
    fn expect_terminator(&mut self) -> Result<()> {
        if self.eat(&Token::Semicolon) || self.at_end() {
            return Ok(());
        }
        Err(self.unexpected("';'"))
    }

    fn unexpected(&self, expected: &str) -> Error {
        let span = self.peek_span();
        let found = match self.peek() {
            Some(tok) => tok.describe(),
            None => "end of file".to_string(),
        };
        Error::Syntax {
            line: span.line(self.source),
            message: format!("unexpected {}, expecting {}", found, expected),
        }
    }

    fn error_at(&self, span: Span, message: impl Into<String>) -> Error {
        Error::Syntax {
            line: span.line(self.source),
            message: message.into(),
        }
    }

    // ── Statements ──

    fn parse_stmt(&mut self) -> Result<Stmt> {
        let start = self.peek_span().start;
        let kind = self.parse_stmt_kind()?;
        Ok(Stmt {
            kind,
            span: Span::new(start, self.last_end().max(start)),
        })
    }

    fn parse_stmt_kind(&mut self) -> Result<StmtKind> {
        let Some(tok) = self.peek().cloned() else {
            return Err(self.unexpected("statement"));
        };

        match tok {
            Token::LeftBrace => Ok(StmtKind::Block(self.parse_block()?)),
            Token::Semicolon => {
                self.advance();
                Ok(StmtKind::Nop)
            }
            Token::Name(word) => self.parse_keyword_stmt(word),
            _ => self.parse_expression_stmt(),
        }
    }

    fn parse_keyword_stmt(&mut self, word: &str) -> Result<StmtKind> {
        let next = self.peek_at(1).cloned();
        let next_is_name = matches!(next, Some(Token::Name(_)));
        match word.to_ascii_lowercase().as_str() {
            "namespace" if next_is_name || matches!(next, Some(Token::LeftBrace)) => {
                self.parse_namespace()
            }
            "use" => self.parse_use(),
            "function" if next_is_name || matches!(next, Some(Token::Ampersand)) => {
                self.advance();
                Ok(StmtKind::Function(self.parse_function_decl()?))
            }
            "abstract" | "final" | "readonly" | "class" | "interface" | "trait" => {
                Ok(StmtKind::Class(self.parse_class_decl()?))
            }
            "enum" if next_is_name => Ok(StmtKind::Class(self.parse_class_decl()?)),
            "const" => {
                self.advance();
                let decl = self.parse_const_items(Visibility::Public)?;
                Ok(StmtKind::Const(decl))
            }
            "if" => self.parse_if(),
            "while" => self.parse_while(),
            "do" => self.parse_do_while(),
            "for" => self.parse_for(),
            "foreach" => self.parse_foreach(),
            "switch" => self.parse_switch(),
            "try" => self.parse_try(),
            "echo" => {
                self.advance();
                let exprs = self.parse_expr_list()?;
                self.expect_terminator()?;
                Ok(StmtKind::Echo(exprs))
            }
            "global" => {
                self.advance();
                let mut names = vec![self.expect_variable()?];
                while self.eat(&Token::Comma) {
                    names.push(self.expect_variable()?);
                }
                self.expect_terminator()?;
                Ok(StmtKind::Global(names))
            }
            "static" if matches!(next, Some(Token::Variable(_))) => {
                self.advance();
                let mut vars = Vec::new();
                loop {
                    let name = self.expect_variable()?;
                    let default = if self.eat(&Token::Equal) {
                        Some(self.parse_expr()?)
                    } else {
                        None
                    };
                    vars.push(StaticVar { name, default });
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect_terminator()?;
                Ok(StmtKind::Static(vars))
            }
            "return" => {
                self.advance();
                let value = if self.check(&Token::Semicolon) || self.at_end() {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect_terminator()?;
                Ok(StmtKind::Return(value))
            }
            "break" | "continue" => {
                let is_break = word.eq_ignore_ascii_case("break");
                self.advance();
                // Loop depth arguments are accepted but only one level unwinds.
                if matches!(self.peek(), Some(Token::Integer(_))) {
                    self.advance();
                }
                self.expect_terminator()?;
                Ok(if is_break {
                    StmtKind::Break
                } else {
                    StmtKind::Continue
                })
            }
            "unset" if matches!(next, Some(Token::LeftParen)) => {
                self.advance();
                self.advance();
                let targets = self.parse_expr_list_until(&Token::RightParen)?;
                self.expect(&Token::RightParen, "')'")?;
                self.expect_terminator()?;
                Ok(StmtKind::Unset(targets))
            }
            _ => self.parse_expression_stmt(),
        }
    }

    fn parse_expression_stmt(&mut self) -> Result<StmtKind> {
        let expr = self.parse_expr()?;
        self.expect_terminator()?;
        Ok(StmtKind::Expression(expr))
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>> {
        self.expect(&Token::LeftBrace, "'{'")?;
        let mut stmts = Vec::new();
        while !self.check(&Token::RightBrace) {
            if self.at_end() {
                return Err(self.unexpected("'}'"));
            }
            stmts.push(self.parse_stmt()?);
        }
        self.advance();
        Ok(stmts)
    }

    /// Body of a control structure: a braced block or a single statement.
    fn parse_body(&mut self) -> Result<Vec<Stmt>> {
        if self.check(&Token::LeftBrace) {
            self.parse_block()
        } else {
            Ok(vec![self.parse_stmt()?])
        }
    }

    fn parse_paren_expr(&mut self) -> Result<Expr> {
        self.expect(&Token::LeftParen, "'('")?;
        let expr = self.parse_expr()?;
        self.expect(&Token::RightParen, "')'")?;
        Ok(expr)
    }

    fn parse_namespace(&mut self) -> Result<StmtKind> {
        self.advance();
        let name = match self.peek() {
            Some(Token::Name(_)) => Some(self.expect_name()?.trim_start_matches('\\').to_string()),
            _ => None,
        };
        if self.check(&Token::LeftBrace) {
            let body = self.parse_block()?;
            return Ok(StmtKind::Namespace {
                name,
                body: Some(body),
            });
        }
        self.expect_terminator()?;
        Ok(StmtKind::Namespace { name, body: None })
    }

    fn parse_use(&mut self) -> Result<StmtKind> {
        self.advance();
        // `use function Foo\bar;` and `use const Foo\BAR;` import the same way.
        if matches!(self.peek_at(1), Some(Token::Name(_))) {
            let _ = self.eat_keyword("function") || self.eat_keyword("const");
        }
        let mut items = Vec::new();
        loop {
            let name = self.expect_name()?.trim_start_matches('\\').to_string();
            let alias = if self.eat_keyword("as") {
                Some(self.expect_name()?)
            } else {
                None
            };
            items.push(UseItem { name, alias });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect_terminator()?;
        Ok(StmtKind::Use(items))
    }

    fn parse_if(&mut self) -> Result<StmtKind> {
        self.advance();
        let cond = self.parse_paren_expr()?;
        let then = self.parse_body()?;
        let mut elseifs = Vec::new();
        let mut otherwise = None;
        loop {
            if self.eat_keyword("elseif") {
                let cond = self.parse_paren_expr()?;
                elseifs.push((cond, self.parse_body()?));
                continue;
            }
            if self.check_keyword("else") {
                if matches!(self.peek_at(1), Some(tok) if tok.is_keyword("if")) {
                    self.advance();
                    self.advance();
                    let cond = self.parse_paren_expr()?;
                    elseifs.push((cond, self.parse_body()?));
                    continue;
                }
                self.advance();
                otherwise = Some(self.parse_body()?);
            }
            break;
        }
        Ok(StmtKind::Control(ControlFlow::If {
            cond,
            then,
            elseifs,
            otherwise,
        }))
    }

    fn parse_while(&mut self) -> Result<StmtKind> {
        self.advance();
        let cond = self.parse_paren_expr()?;
        let body = self.parse_body()?;
        Ok(StmtKind::Control(ControlFlow::While { cond, body }))
    }

    fn parse_do_while(&mut self) -> Result<StmtKind> {
        self.advance();
        let body = self.parse_body()?;
        self.expect_keyword("while")?;
        let cond = self.parse_paren_expr()?;
        self.expect_terminator()?;
        Ok(StmtKind::Control(ControlFlow::DoWhile { body, cond }))
    }

    fn parse_for(&mut self) -> Result<StmtKind> {
        self.advance();
        self.expect(&Token::LeftParen, "'('")?;
        let init = self.parse_expr_list_until(&Token::Semicolon)?;
        self.expect(&Token::Semicolon, "';'")?;
        let cond = self.parse_expr_list_until(&Token::Semicolon)?;
        self.expect(&Token::Semicolon, "';'")?;
        let step = self.parse_expr_list_until(&Token::RightParen)?;
        self.expect(&Token::RightParen, "')'")?;
        let body = self.parse_body()?;
        Ok(StmtKind::Control(ControlFlow::For {
            init,
            cond,
            step,
            body,
        }))
    }

    fn parse_foreach(&mut self) -> Result<StmtKind> {
        self.advance();
        self.expect(&Token::LeftParen, "'('")?;
        let subject = self.parse_expr()?;
        self.expect_keyword("as")?;
        let mut by_ref = self.eat(&Token::Ampersand);
        let first = self.expect_variable()?;
        let (key, value) = if self.eat(&Token::FatArrow) {
            by_ref = self.eat(&Token::Ampersand);
            (Some(first), self.expect_variable()?)
        } else {
            (None, first)
        };
        self.expect(&Token::RightParen, "')'")?;
        let body = self.parse_body()?;
        Ok(StmtKind::Control(ControlFlow::Foreach {
            subject,
            key,
            value,
            by_ref,
            body,
        }))
    }

    fn parse_switch(&mut self) -> Result<StmtKind> {
        self.advance();
        let subject = self.parse_paren_expr()?;
        self.expect(&Token::LeftBrace, "'{'")?;
        let mut cases = Vec::new();
        while !self.eat(&Token::RightBrace) {
            let test = if self.eat_keyword("case") {
                Some(self.parse_expr()?)
            } else if self.eat_keyword("default") {
                None
            } else {
                return Err(self.unexpected("'case' or 'default'"));
            };
            if !self.eat(&Token::Colon) {
                self.expect(&Token::Semicolon, "':'")?;
            }
            let mut body = Vec::new();
            while !(self.check_keyword("case")
                || self.check_keyword("default")
                || self.check(&Token::RightBrace))
            {
                if self.at_end() {
                    return Err(self.unexpected("'}'"));
                }
                body.push(self.parse_stmt()?);
            }
            cases.push(SwitchCase { test, body });
        }
        Ok(StmtKind::Control(ControlFlow::Switch { subject, cases }))
    }

    fn parse_try(&mut self) -> Result<StmtKind> {
        self.advance();
        let body = self.parse_block()?;
        let mut catches = Vec::new();
        while self.eat_keyword("catch") {
            self.expect(&Token::LeftParen, "'('")?;
            let mut types = vec![self.expect_name()?];
            while self.eat(&Token::Pipe) {
                types.push(self.expect_name()?);
            }
            let var = match self.peek() {
                Some(Token::Variable(_)) => Some(self.expect_variable()?),
                _ => None,
            };
            self.expect(&Token::RightParen, "')'")?;
            let body = self.parse_block()?;
            catches.push(CatchClause { types, var, body });
        }
        let finally = if self.eat_keyword("finally") {
            Some(self.parse_block()?)
        } else {
            None
        };
        if catches.is_empty() && finally.is_none() {
            return Err(self.unexpected("'catch' or 'finally'"));
        }
        Ok(StmtKind::Control(ControlFlow::Try {
            body,
            catches,
            finally,
        }))
    }

    // ── Declarations ──

    /// Parses after the `function` keyword.
    fn parse_function_decl(&mut self) -> Result<FunctionDecl> {
        self.eat(&Token::Ampersand);
        let name = self.expect_name()?;
        let params = self.parse_params()?;
        let return_type = self.parse_return_type()?;
        let body = self.parse_block()?;
        Ok(FunctionDecl {
            name,
            params,
            return_type,
            body: Rc::new(body),
        })
    }

    fn parse_params(&mut self) -> Result<Vec<Param>> {
        self.expect(&Token::LeftParen, "'('")?;
        let mut params = Vec::new();
        while !self.eat(&Token::RightParen) {
            let mut promoted = None;
            loop {
                if let Some(vis) = self.eat_visibility() {
                    promoted = Some(vis);
                } else if !self.eat_keyword("readonly") {
                    break;
                }
            }
            let type_hint = if matches!(
                self.peek(),
                Some(Token::Variable(_) | Token::Ampersand | Token::Ellipsis)
            ) {
                None
            } else {
                Some(self.parse_type()?)
            };
            let by_ref = self.eat(&Token::Ampersand);
            let variadic = self.eat(&Token::Ellipsis);
            let name = self.expect_variable()?;
            let default = if self.eat(&Token::Equal) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            params.push(Param {
                name,
                type_hint,
                default,
                by_ref,
                variadic,
                promoted,
            });
            if !self.eat(&Token::Comma) {
                self.expect(&Token::RightParen, "')'")?;
                break;
            }
        }
        Ok(params)
    }

    fn parse_type(&mut self) -> Result<String> {
        let mut ty = String::new();
        if self.eat(&Token::Question) {
            ty.push('?');
        }
        ty.push_str(&self.expect_name()?);
        while matches!(self.peek(), Some(Token::Pipe | Token::Ampersand))
            && matches!(self.peek_at(1), Some(Token::Name(_)))
        {
            let sep = if self.eat(&Token::Pipe) { '|' } else { '&' };
            self.eat(&Token::Ampersand);
            ty.push(sep);
            ty.push_str(&self.expect_name()?);
        }
        Ok(ty)
    }

    fn parse_return_type(&mut self) -> Result<Option<String>> {
        if self.eat(&Token::Colon) {
            Ok(Some(self.parse_type()?))
        } else {
            Ok(None)
        }
    }

    fn eat_visibility(&mut self) -> Option<Visibility> {
        let vis = match self.peek() {
            Some(tok) if tok.is_keyword("public") => Visibility::Public,
            Some(tok) if tok.is_keyword("protected") => Visibility::Protected,
            Some(tok) if tok.is_keyword("private") => Visibility::Private,
            _ => return None,
        };
        self.advance();
        Some(vis)
    }

    fn parse_class_decl(&mut self) -> Result<ClassDecl> {
        let mut is_abstract = false;
        loop {
            if self.eat_keyword("abstract") {
                is_abstract = true;
            } else if !(self.eat_keyword("final") || self.eat_keyword("readonly")) {
                break;
            }
        }

        let kind = match self.advance() {
            Some((tok, _)) if tok.is_keyword("class") => ClassKind::Class,
            Some((tok, _)) if tok.is_keyword("interface") => ClassKind::Interface,
            Some((tok, _)) if tok.is_keyword("trait") => ClassKind::Trait,
            Some((tok, _)) if tok.is_keyword("enum") => ClassKind::Enum,
            _ => {
                self.pos = self.pos.saturating_sub(1);
                return Err(self.unexpected("'class'"));
            }
        };
        let name = self.expect_name()?;

        // Backed enums: `enum Suit: string`.
        if kind == ClassKind::Enum && self.eat(&Token::Colon) {
            self.parse_type()?;
        }

        let mut parent = None;
        let mut interfaces = Vec::new();
        if self.eat_keyword("extends") {
            if kind == ClassKind::Interface {
                interfaces = self.parse_name_list()?;
            } else {
                parent = Some(self.expect_name()?);
            }
        }
        if self.eat_keyword("implements") {
            interfaces = self.parse_name_list()?;
        }

        self.expect(&Token::LeftBrace, "'{'")?;
        let mut members = Vec::new();
        while !self.eat(&Token::RightBrace) {
            if self.at_end() {
                return Err(self.unexpected("'}'"));
            }
            self.parse_class_member(&mut members)?;
        }

        Ok(ClassDecl {
            kind,
            name,
            parent,
            interfaces,
            is_abstract,
            members,
        })
    }

    fn parse_name_list(&mut self) -> Result<Vec<String>> {
        let mut names = vec![self.expect_name()?];
        while self.eat(&Token::Comma) {
            names.push(self.expect_name()?);
        }
        Ok(names)
    }

    fn parse_class_member(&mut self, members: &mut Vec<ClassMember>) -> Result<()> {
        if self.eat_keyword("use") {
            let traits = self.parse_name_list()?;
            if self.check(&Token::LeftBrace) {
                // Conflict resolution blocks are accepted and ignored.
                let mut depth = 0usize;
                while let Some((tok, _)) = self.advance() {
                    match tok {
                        Token::LeftBrace => depth += 1,
                        Token::RightBrace => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                }
            } else {
                self.expect(&Token::Semicolon, "';'")?;
            }
            members.push(ClassMember::TraitUse(traits));
            return Ok(());
        }

        if self.eat_keyword("case") {
            let name = self.expect_name()?;
            let value = if self.eat(&Token::Equal) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            self.expect(&Token::Semicolon, "';'")?;
            members.push(ClassMember::Case { name, value });
            return Ok(());
        }

        let start = self.peek_span().start;
        let mut visibility = Visibility::Public;
        let mut is_static = false;
        let mut is_abstract = false;
        loop {
            if let Some(vis) = self.eat_visibility() {
                visibility = vis;
            } else if self.eat_keyword("static") {
                is_static = true;
            } else if self.eat_keyword("abstract") {
                is_abstract = true;
            } else if !(self.eat_keyword("final")
                || self.eat_keyword("readonly")
                || self.eat_keyword("var"))
            {
                break;
            }
        }

        if self.eat_keyword("const") {
            // Typed class constants: `const string NAME = ...`.
            if matches!(self.peek_at(1), Some(Token::Name(_))) {
                self.parse_type()?;
            }
            let decl = self.parse_const_items(visibility)?;
            members.push(ClassMember::Const(decl));
            return Ok(());
        }

        if self.eat_keyword("function") {
            self.eat(&Token::Ampersand);
            let name = self.expect_name()?;
            let params = self.parse_params()?;
            let return_type = self.parse_return_type()?;
            let body = if self.eat(&Token::Semicolon) {
                None
            } else {
                Some(Rc::new(self.parse_block()?))
            };
            members.push(ClassMember::Method(MethodDecl {
                name,
                params,
                return_type,
                body,
                visibility,
                is_static,
                is_abstract,
                span: Span::new(start, self.last_end()),
            }));
            return Ok(());
        }

        // Property, optionally typed.
        if !matches!(self.peek(), Some(Token::Variable(_))) {
            self.parse_type()?;
        }
        loop {
            let name = self.expect_variable()?;
            let default = if self.eat(&Token::Equal) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            members.push(ClassMember::Property(PropertyDecl {
                name,
                default,
                visibility,
                is_static,
            }));
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::Semicolon, "';'")
    }

    /// Parses `NAME = expr, ...;` after the `const` keyword.
    fn parse_const_items(&mut self, visibility: Visibility) -> Result<ConstDecl> {
        let mut items = Vec::new();
        loop {
            let name = self.expect_name()?;
            self.expect(&Token::Equal, "'='")?;
            let value = self.parse_expr()?;
            items.push(ConstItem { name, value });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect_terminator()?;
        Ok(ConstDecl { items, visibility })
    }

    // ── Expressions (Pratt precedence) ──

    pub fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_expr_bp(0)
    }

    fn parse_expr_list(&mut self) -> Result<Vec<Expr>> {
        let mut exprs = vec![self.parse_expr()?];
        while self.eat(&Token::Comma) {
            exprs.push(self.parse_expr()?);
        }
        Ok(exprs)
    }

    fn parse_expr_list_until(&mut self, end: &Token<'_>) -> Result<Vec<Expr>> {
        if self.check(end) {
            return Ok(Vec::new());
        }
        self.parse_expr_list()
    }

    fn parse_expr_bp(&mut self, min_bp: u8) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;

        // Assignment binds to the nearest assignable operand, whatever the
        // surrounding precedence.
        if lhs.is_assignable() {
            if let Some(op) = self.peek().and_then(compound_assign_op) {
                self.advance();
                let value = self.parse_expr_bp(ASSIGN_BP)?;
                return Ok(Expr::Assign {
                    target: Box::new(lhs),
                    op,
                    value: Box::new(value),
                });
            }
        }

        loop {
            if self.check_keyword("instanceof") {
                if INSTANCEOF_BP < min_bp {
                    break;
                }
                self.advance();
                let class = self.expect_name()?;
                lhs = Expr::Instanceof {
                    expr: Box::new(lhs),
                    class,
                };
                continue;
            }

            if self.check(&Token::Question) {
                if TERNARY_BP < min_bp {
                    break;
                }
                self.advance();
                let then = if self.eat(&Token::Colon) {
                    None
                } else {
                    let then = self.parse_expr_bp(ASSIGN_BP)?;
                    self.expect(&Token::Colon, "':'")?;
                    Some(Box::new(then))
                };
                let otherwise = self.parse_expr_bp(TERNARY_BP + 1)?;
                lhs = Expr::Ternary {
                    cond: Box::new(lhs),
                    then,
                    otherwise: Box::new(otherwise),
                };
                continue;
            }

            let Some((lbp, rbp, op)) = self.peek().and_then(infix_bp) else {
                break;
            };
            if lbp < min_bp {
                break;
            }
            self.advance();
            let rhs = self.parse_expr_bp(rbp)?;
            lhs = Expr::Binary {
                op,
                left: Box::new(lhs),
                right: Box::new(rhs),
            };
        }

        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let op = match self.peek() {
            Some(Token::Bang) => Some(UnaryOp::Not),
            Some(Token::Minus) => Some(UnaryOp::Neg),
            Some(Token::Plus) => Some(UnaryOp::Plus),
            Some(Token::At) => Some(UnaryOp::Silence),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let expr = self.parse_expr_bp(PREFIX_BP)?;
            return Ok(Expr::Unary {
                op,
                expr: Box::new(expr),
            });
        }

        if matches!(self.peek(), Some(Token::PlusPlus | Token::MinusMinus)) {
            let increment = matches!(self.advance(), Some((Token::PlusPlus, _)));
            let target = self.parse_unary()?;
            if !target.is_assignable() {
                return Err(self.error_at(self.peek_span(), "cannot increment a non-variable"));
            }
            return Ok(Expr::IncDec {
                target: Box::new(target),
                increment,
                prefix: true,
            });
        }

        // Casts: `(int) $x`.
        if self.check(&Token::LeftParen) && matches!(self.peek_at(2), Some(Token::RightParen)) {
            if let Some(Token::Name(name)) = self.peek_at(1) {
                if let Some(ty) = CastType::from_name(name) {
                    self.pos += 3;
                    let expr = self.parse_expr_bp(PREFIX_BP)?;
                    return Ok(Expr::Cast {
                        ty,
                        expr: Box::new(expr),
                    });
                }
            }
        }

        let primary = self.parse_primary()?;
        self.parse_postfix(primary)
    }

    fn parse_postfix(&mut self, mut expr: Expr) -> Result<Expr> {
        loop {
            match self.peek() {
                Some(Token::LeftBracket) => {
                    self.advance();
                    let index = if self.check(&Token::RightBracket) {
                        None
                    } else {
                        Some(Box::new(self.parse_expr()?))
                    };
                    self.expect(&Token::RightBracket, "']'")?;
                    expr = Expr::Index {
                        base: Box::new(expr),
                        index,
                    };
                }
                Some(Token::Arrow) => {
                    self.advance();
                    let name = self.expect_name()?;
                    if self.check(&Token::LeftParen) {
                        let args = self.parse_args()?;
                        expr = Expr::MethodCall {
                            object: Box::new(expr),
                            method: name,
                            args,
                        };
                    } else {
                        expr = Expr::PropFetch {
                            object: Box::new(expr),
                            name,
                        };
                    }
                }
                Some(Token::LeftParen) => {
                    let args = self.parse_args()?;
                    expr = Expr::CallValue {
                        callee: Box::new(expr),
                        args,
                    };
                }
                Some(Token::PlusPlus | Token::MinusMinus) if expr.is_assignable() => {
                    let increment = matches!(self.advance(), Some((Token::PlusPlus, _)));
                    expr = Expr::IncDec {
                        target: Box::new(expr),
                        increment,
                        prefix: false,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>> {
        self.expect(&Token::LeftParen, "'('")?;
        let mut args = Vec::new();
        while !self.eat(&Token::RightParen) {
            args.push(self.parse_expr()?);
            if !self.eat(&Token::Comma) {
                self.expect(&Token::RightParen, "')'")?;
                break;
            }
        }
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let span = self.peek_span();
        let Some((tok, _)) = self.advance() else {
            return Err(self.unexpected("expression"));
        };

        match tok {
            Token::Variable(name) => Ok(Expr::Var(name.to_string())),
            Token::Integer(digits) => digits
                .parse::<i64>()
                .map(Expr::Int)
                .or_else(|_| digits.parse::<f64>().map(Expr::Float))
                .map_err(|_| self.error_at(span, format!("invalid number {}", digits))),
            Token::Float(digits) => digits
                .parse::<f64>()
                .map(Expr::Float)
                .map_err(|_| self.error_at(span, format!("invalid number {}", digits))),
            Token::SingleQuoted(raw) => Ok(Expr::String(unescape_single(raw))),
            Token::DoubleQuoted(raw) => self.parse_interpolated(raw, span),
            Token::LeftBracket => {
                let items = self.parse_array_items(&Token::RightBracket)?;
                Ok(Expr::Array(items))
            }
            Token::LeftParen => {
                let expr = self.parse_expr()?;
                self.expect(&Token::RightParen, "')'")?;
                Ok(expr)
            }
            Token::Name(name) => self.parse_name_expr(name, span),
            _ => {
                self.pos -= 1;
                Err(self.unexpected("expression"))
            }
        }
    }

    fn parse_name_expr(&mut self, name: &'src str, span: Span) -> Result<Expr> {
        let lower = name.to_ascii_lowercase();
        match lower.as_str() {
            "true" => return Ok(Expr::Bool(true)),
            "false" => return Ok(Expr::Bool(false)),
            "null" => return Ok(Expr::Null),
            "array" if self.check(&Token::LeftParen) => {
                self.advance();
                return Ok(Expr::Array(self.parse_array_items(&Token::RightParen)?));
            }
            "isset" => {
                self.expect(&Token::LeftParen, "'('")?;
                let exprs = self.parse_expr_list()?;
                self.expect(&Token::RightParen, "')'")?;
                return Ok(Expr::Isset(exprs));
            }
            "empty" => {
                let expr = self.parse_paren_expr()?;
                return Ok(Expr::Empty(Box::new(expr)));
            }
            "new" => {
                let class = self.expect_name()?;
                let args = if self.check(&Token::LeftParen) {
                    self.parse_args()?
                } else {
                    Vec::new()
                };
                return Ok(Expr::New { class, args });
            }
            "function" | "fn" => return self.parse_closure(lower == "fn", false),
            "static" if self.check_keyword("function") || self.check_keyword("fn") => {
                let arrow = self.check_keyword("fn");
                self.advance();
                return self.parse_closure(arrow, true);
            }
            "include" | "include_once" | "require" | "require_once" => {
                let kind = match lower.as_str() {
                    "include" => IncludeKind::Include,
                    "include_once" => IncludeKind::IncludeOnce,
                    "require" => IncludeKind::Require,
                    _ => IncludeKind::RequireOnce,
                };
                let path = self.parse_expr_bp(ASSIGN_BP)?;
                return Ok(Expr::Include {
                    kind,
                    path: Box::new(path),
                });
            }
            "exit" | "die" => {
                let code = if self.eat(&Token::LeftParen) {
                    if self.eat(&Token::RightParen) {
                        None
                    } else {
                        let code = self.parse_expr()?;
                        self.expect(&Token::RightParen, "')'")?;
                        Some(Box::new(code))
                    }
                } else {
                    None
                };
                return Ok(Expr::Exit(code));
            }
            "print" => {
                let expr = self.parse_expr_bp(ASSIGN_BP)?;
                return Ok(Expr::Print(Box::new(expr)));
            }
            "throw" => {
                let expr = self.parse_expr_bp(ASSIGN_BP)?;
                return Ok(Expr::Throw(Box::new(expr)));
            }
            "match" if self.check(&Token::LeftParen) => return self.parse_match(),
            _ => {}
        }

        if self.eat(&Token::DoubleColon) {
            return self.parse_static_access(name.to_string());
        }
        if self.check(&Token::LeftParen) {
            let args = self.parse_args()?;
            return Ok(Expr::Call {
                name: name.to_string(),
                args,
            });
        }
        if RESERVED.contains(&lower.as_str()) {
            return Err(self.error_at(span, format!("unexpected '{}'", name)));
        }
        Ok(Expr::ConstFetch(name.to_string()))
    }

    /// Parses after `Class::`.
    fn parse_static_access(&mut self, class: String) -> Result<Expr> {
        match self.advance() {
            Some((Token::Variable(name), _)) => Ok(Expr::StaticPropFetch {
                class,
                name: name.to_string(),
            }),
            Some((Token::Name(name), _)) => {
                if self.check(&Token::LeftParen) {
                    let args = self.parse_args()?;
                    Ok(Expr::StaticCall {
                        class,
                        method: name.to_string(),
                        args,
                    })
                } else {
                    Ok(Expr::ClassConstFetch {
                        class,
                        name: name.to_string(),
                    })
                }
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.unexpected("member name"))
            }
        }
    }

    /// Parses after the `match` keyword.
    fn parse_match(&mut self) -> Result<Expr> {
        let subject = self.parse_paren_expr()?;
        self.expect(&Token::LeftBrace, "'{'")?;
        let mut arms = Vec::new();
        while !self.eat(&Token::RightBrace) {
            let conditions = if self.check_keyword("default")
                && matches!(self.peek_at(1), Some(Token::FatArrow))
            {
                self.advance();
                None
            } else {
                let mut conds = vec![self.parse_expr()?];
                while self.eat(&Token::Comma) {
                    if self.check(&Token::FatArrow) {
                        break;
                    }
                    conds.push(self.parse_expr()?);
                }
                Some(conds)
            };
            self.expect(&Token::FatArrow, "'=>'")?;
            let body = self.parse_expr()?;
            arms.push(MatchArm { conditions, body });
            if !self.eat(&Token::Comma) {
                self.expect(&Token::RightBrace, "'}'")?;
                break;
            }
        }
        Ok(Expr::Match {
            subject: Box::new(subject),
            arms,
        })
    }

    fn parse_closure(&mut self, is_arrow: bool, is_static: bool) -> Result<Expr> {
        self.eat(&Token::Ampersand);
        let params = self.parse_params()?;
        let mut uses = Vec::new();
        if !is_arrow && self.eat_keyword("use") {
            self.expect(&Token::LeftParen, "'('")?;
            while !self.eat(&Token::RightParen) {
                self.eat(&Token::Ampersand);
                uses.push(self.expect_variable()?);
                if !self.eat(&Token::Comma) {
                    self.expect(&Token::RightParen, "')'")?;
                    break;
                }
            }
        }
        let return_type = self.parse_return_type()?;
        let body = if is_arrow {
            self.expect(&Token::FatArrow, "'=>'")?;
            let start = self.peek_span().start;
            let expr = self.parse_expr_bp(ASSIGN_BP)?;
            vec![Stmt {
                kind: StmtKind::Return(Some(expr)),
                span: Span::new(start, self.last_end()),
            }]
        } else {
            self.parse_block()?
        };
        Ok(Expr::Closure(Rc::new(ClosureDecl {
            params,
            uses,
            return_type,
            body: Rc::new(body),
            is_arrow,
            is_static,
        })))
    }

    fn parse_array_items(&mut self, end: &Token<'_>) -> Result<Vec<ArrayItem>> {
        let mut items = Vec::new();
        while !self.eat(end) {
            let first = self.parse_expr()?;
            let item = if self.eat(&Token::FatArrow) {
                ArrayItem {
                    key: Some(first),
                    value: self.parse_expr()?,
                }
            } else {
                ArrayItem {
                    key: None,
                    value: first,
                }
            };
            items.push(item);
            if !self.eat(&Token::Comma) {
                self.expect(end, "end of array")?;
                break;
            }
        }
        Ok(items)
    }

    /// Split a double-quoted literal into literal text and interpolated
    /// variables (`$name`, `$name->prop`, `$name[key]`, `{$expr}`).
    fn parse_interpolated(&self, raw: &str, span: Span) -> Result<Expr> {
        let text = unescape_double(raw);
        let bytes = text.as_bytes();
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut i = 0;

        let is_ident_start = |b: u8| b.is_ascii_alphabetic() || b == b'_';
        let is_ident = |b: u8| b.is_ascii_alphanumeric() || b == b'_';

        while i < bytes.len() {
            let rest = &text[i..];
            if rest.starts_with("{$") {
                let Some(close) = rest.find('}') else {
                    return Err(self.error_at(span, "unterminated {$ in string"));
                };
                let inner = &rest[1..close];
                let expr = parse_expression(inner).map_err(|err| match err {
                    Error::Syntax { message, .. } => self.error_at(span, message),
                    other => other,
                })?;
                flush_literal(&mut literal, &mut parts);
                parts.push(StringPart::Expr(expr));
                i += close + 1;
                continue;
            }
            if bytes[i] == b'$' && i + 1 < bytes.len() && is_ident_start(bytes[i + 1]) {
                let mut end = i + 1;
                while end < bytes.len() && is_ident(bytes[end]) {
                    end += 1;
                }
                let mut expr = Expr::Var(text[i + 1..end].to_string());

                if text[end..].starts_with("->")
                    && end + 2 < bytes.len()
                    && is_ident_start(bytes[end + 2])
                {
                    let mut prop_end = end + 2;
                    while prop_end < bytes.len() && is_ident(bytes[prop_end]) {
                        prop_end += 1;
                    }
                    expr = Expr::PropFetch {
                        object: Box::new(expr),
                        name: text[end + 2..prop_end].to_string(),
                    };
                    end = prop_end;
                } else if end < bytes.len() && bytes[end] == b'[' {
                    if let Some(close) = text[end..].find(']') {
                        let key = &text[end + 1..end + close];
                        let index = match key.parse::<i64>() {
                            Ok(n) => Expr::Int(n),
                            Err(_) => match key.strip_prefix('$') {
                                Some(var) => Expr::Var(var.to_string()),
                                None => Expr::String(key.trim_matches('\'').to_string()),
                            },
                        };
                        expr = Expr::Index {
                            base: Box::new(expr),
                            index: Some(Box::new(index)),
                        };
                        end += close + 1;
                    }
                }

                flush_literal(&mut literal, &mut parts);
                parts.push(StringPart::Expr(expr));
                i = end;
                continue;
            }

            let ch = rest.chars().next().unwrap_or('\0');
            // Escaped `\$` is carried through unescaping as NUL.
            literal.push(if ch == '\0' { '$' } else { ch });
            i += ch.len_utf8();
        }

        if parts.is_empty() {
            return Ok(Expr::String(literal));
        }
        flush_literal(&mut literal, &mut parts);
        Ok(Expr::Interpolated(parts))
    }
}

fn flush_literal(literal: &mut String, parts: &mut Vec<StringPart>) {
    if !literal.is_empty() {
        parts.push(StringPart::Literal(std::mem::take(literal)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expr(src: &str) -> Expr {
        parse_expression(src).unwrap()
    }

    fn first(src: &str) -> StmtKind {
        parse(src).unwrap().remove(0).kind
    }

    #[test]
    fn test_precedence() {
        assert_eq!(
            expr("1 + 2 * 3"),
            Expr::Binary {
                op: BinaryOp::Add,
                left: Box::new(Expr::Int(1)),
                right: Box::new(Expr::Binary {
                    op: BinaryOp::Mul,
                    left: Box::new(Expr::Int(2)),
                    right: Box::new(Expr::Int(3)),
                }),
            }
        );
    }

    #[test]
    fn test_assignment_is_right_associative() {
        let Expr::Assign { target, value, .. } = expr("$a = $b = 2") else {
            panic!("expected assignment");
        };
        assert_eq!(*target, Expr::Var("a".into()));
        assert!(matches!(*value, Expr::Assign { .. }));
    }

    #[test]
    fn test_missing_semicolon_at_end_of_input() {
        let stmts = parse("$a = 1").unwrap();
        assert_eq!(stmts.len(), 1);
        assert!(parse("$a = 1 $b = 2").is_err());
    }

    #[test]
    fn test_function_declaration() {
        let source = "function greet($name = 'world'): string { return \"hi $name\"; }";
        let StmtKind::Function(decl) = first(source) else {
            panic!("expected function");
        };
        assert_eq!(decl.name, "greet");
        assert_eq!(decl.params.len(), 1);
        assert_eq!(decl.return_type.as_deref(), Some("string"));
        assert_eq!(decl.body.len(), 1);
    }

    #[test]
    fn test_class_declaration() {
        let src = r#"
            abstract class Greeter extends Base implements A, B {
                const PREFIX = "Hi";
                private static $count = 0;
                public string $name;
                abstract public function greet();
                public static function make(): static { return new static(); }
            }
        "#;
        let StmtKind::Class(class) = first(src) else {
            panic!("expected class");
        };
        assert_eq!(class.kind, ClassKind::Class);
        assert!(class.is_abstract);
        assert_eq!(class.parent.as_deref(), Some("Base"));
        assert_eq!(class.interfaces, vec!["A", "B"]);
        assert_eq!(class.members.len(), 5);
        assert!(matches!(
            &class.members[1],
            ClassMember::Property(p) if p.is_static && p.visibility == Visibility::Private
        ));
        assert!(matches!(
            &class.members[3],
            ClassMember::Method(m) if m.is_abstract && m.body.is_none()
        ));
    }

    #[test]
    fn test_conditional_function() {
        let StmtKind::Control(flow) = first("if (true) { function conditional() { return 1; } }")
        else {
            panic!("expected if");
        };
        assert_eq!(flow.kind(), "if");
        assert!(matches!(flow.bodies()[0][0].kind, StmtKind::Function(_)));
    }

    #[test]
    fn test_interpolation() {
        let Expr::Interpolated(parts) = expr(r#""Hello, $name! {$user->id} \$x""#) else {
            panic!("expected interpolation");
        };
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[0], StringPart::Literal("Hello, ".into()));
        assert_eq!(parts[1], StringPart::Expr(Expr::Var("name".into())));
        assert_eq!(parts[4], StringPart::Literal(" $x".into()));
    }

    #[test]
    fn test_statement_span_text() {
        let source = "<?php\necho 'hi';\n$x = strlen('abc');";
        let stmts = parse(source).unwrap();
        assert_eq!(stmts[0].span.text(source), "echo 'hi';");
        assert_eq!(stmts[1].span.text(source), "$x = strlen('abc');");
    }

    #[test]
    fn test_syntax_error_line() {
        let err = parse("<?php\nfunction broken( {\n}").unwrap_err();
        match err {
            Error::Syntax { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_namespace_and_use() {
        let stmts = parse("namespace App\\Models;\nuse Foo\\Bar as Baz;\nclass User {}").unwrap();
        assert!(matches!(
            &stmts[0].kind,
            StmtKind::Namespace { name: Some(n), body: None } if n == "App\\Models"
        ));
        assert!(matches!(&stmts[1].kind, StmtKind::Use(items) if items[0].visible_name() == "Baz"));
    }

    #[test]
    fn test_match_expression() {
        let Expr::Match { arms, .. } = expr("match ($x) { 1, 2 => 'low', default => 'high' }")
        else {
            panic!("expected match");
        };
        assert_eq!(arms.len(), 2);
        assert_eq!(arms[0].conditions.as_ref().map(Vec::len), Some(2));
        assert!(arms[1].conditions.is_none());
    }

    #[test]
    fn test_closures() {
        assert!(matches!(expr("fn($x) => $x * 2"), Expr::Closure(c) if c.is_arrow));
        assert!(matches!(
            expr("function ($x) use ($y) { return $x + $y; }"),
            Expr::Closure(c) if c.uses == vec!["y".to_string()]
        ));
    }
}
