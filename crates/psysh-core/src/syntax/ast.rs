//! Syntax tree for the scripting language.
//!
//! Statements are a closed union: every consumer (interpreter, reload
//! visitor) matches exhaustively over [`StmtKind`].

use std::fmt;
use std::rc::Rc;

/// Byte range into the source text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Span covering both `self` and `other`.
    pub fn to(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// 1-based line number of the span start.
    pub fn line(&self, source: &str) -> usize {
        let end = self.start.min(source.len());
        source.as_bytes()[..end].iter().filter(|&&b| b == b'\n').count() + 1
    }

    /// Source text covered by the span.
    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        source.get(self.start..self.end.min(source.len())).unwrap_or("")
    }
}

/// A statement with its source span.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// `namespace Foo;` (body `None`) or `namespace Foo { ... }`.
    Namespace {
        name: Option<String>,
        body: Option<Vec<Stmt>>,
    },
    /// `use Foo\Bar as Baz;`
    Use(Vec<UseItem>),
    Class(ClassDecl),
    Function(FunctionDecl),
    Const(ConstDecl),
    Control(ControlFlow),
    Expression(Expr),
    Echo(Vec<Expr>),
    Global(Vec<String>),
    Static(Vec<StaticVar>),
    Return(Option<Expr>),
    Break,
    Continue,
    Unset(Vec<Expr>),
    Block(Vec<Stmt>),
    Nop,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UseItem {
    pub name: String,
    pub alias: Option<String>,
}

impl UseItem {
    /// The short name this import is visible as.
    pub fn visible_name(&self) -> &str {
        match &self.alias {
            Some(alias) => alias,
            None => self.name.rsplit('\\').next().unwrap_or(&self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StaticVar {
    pub name: String,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Class,
    Interface,
    Trait,
    Enum,
}

impl ClassKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassKind::Class => "class",
            ClassKind::Interface => "interface",
            ClassKind::Trait => "trait",
            ClassKind::Enum => "enum",
        }
    }
}

impl fmt::Display for ClassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    Public,
    Protected,
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Protected => "protected",
            Visibility::Private => "private",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassDecl {
    pub kind: ClassKind,
    pub name: String,
    pub parent: Option<String>,
    /// `implements` for classes and enums, `extends` for interfaces.
    pub interfaces: Vec<String>,
    pub is_abstract: bool,
    pub members: Vec<ClassMember>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClassMember {
    Method(MethodDecl),
    Property(PropertyDecl),
    Const(ConstDecl),
    Case { name: String, value: Option<Expr> },
    TraitUse(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodDecl {
    pub name: String,
    pub params: Vec<Param>,
    pub return_type: Option<String>,
    /// `None` for abstract and interface methods.
    pub body: Option<Rc<Vec<Stmt>>>,
    pub visibility: Visibility,
    pub is_static: bool,
    pub is_abstract: bool,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDecl {
    pub name: String,
    pub default: Option<Expr>,
    pub visibility: Visibility,
    pub is_static: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<Param>,
    pub return_type: Option<String>,
    pub body: Rc<Vec<Stmt>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstDecl {
    pub items: Vec<ConstItem>,
    pub visibility: Visibility,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstItem {
    pub name: String,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub type_hint: Option<String>,
    pub default: Option<Expr>,
    pub by_ref: bool,
    pub variadic: bool,
    /// Constructor property promotion (`public function __construct(private $x)`).
    pub promoted: Option<Visibility>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlFlow {
    If {
        cond: Expr,
        then: Vec<Stmt>,
        elseifs: Vec<(Expr, Vec<Stmt>)>,
        otherwise: Option<Vec<Stmt>>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    DoWhile {
        body: Vec<Stmt>,
        cond: Expr,
    },
    For {
        init: Vec<Expr>,
        cond: Vec<Expr>,
        step: Vec<Expr>,
        body: Vec<Stmt>,
    },
    Foreach {
        subject: Expr,
        key: Option<String>,
        value: String,
        by_ref: bool,
        body: Vec<Stmt>,
    },
    Switch {
        subject: Expr,
        cases: Vec<SwitchCase>,
    },
    Try {
        body: Vec<Stmt>,
        catches: Vec<CatchClause>,
        finally: Option<Vec<Stmt>>,
    },
}

impl ControlFlow {
    /// Keyword naming the construct, as shown in reload warnings.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlFlow::If { .. } => "if",
            ControlFlow::While { .. } => "while",
            ControlFlow::DoWhile { .. } => "do-while",
            ControlFlow::For { .. } => "for",
            ControlFlow::Foreach { .. } => "foreach",
            ControlFlow::Switch { .. } => "switch",
            ControlFlow::Try { .. } => "try-catch",
        }
    }

    /// Every statement list nested directly in this construct.
    pub fn bodies(&self) -> Vec<&[Stmt]> {
        match self {
            ControlFlow::If {
                then,
                elseifs,
                otherwise,
                ..
            } => {
                let mut bodies = vec![then.as_slice()];
                bodies.extend(elseifs.iter().map(|(_, body)| body.as_slice()));
                bodies.extend(otherwise.as_deref());
                bodies
            }
            ControlFlow::While { body, .. }
            | ControlFlow::DoWhile { body, .. }
            | ControlFlow::For { body, .. }
            | ControlFlow::Foreach { body, .. } => vec![body.as_slice()],
            ControlFlow::Switch { cases, .. } => cases.iter().map(|c| c.body.as_slice()).collect(),
            ControlFlow::Try {
                body,
                catches,
                finally,
            } => {
                let mut bodies = vec![body.as_slice()];
                bodies.extend(catches.iter().map(|c| c.body.as_slice()));
                bodies.extend(finally.as_deref());
                bodies
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchCase {
    /// `None` for `default:`.
    pub test: Option<Expr>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatchClause {
    pub types: Vec<String>,
    pub var: Option<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Concat,
    Eq,
    NotEq,
    Identical,
    NotIdentical,
    Lt,
    Gt,
    LtEq,
    GtEq,
    And,
    Or,
    Coalesce,
    BitAnd,
    BitOr,
}

impl BinaryOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Concat => ".",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Identical => "===",
            BinaryOp::NotIdentical => "!==",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::LtEq => "<=",
            BinaryOp::GtEq => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::Coalesce => "??",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Plus,
    /// `@expr`: evaluate with warnings suppressed.
    Silence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncludeKind {
    Include,
    IncludeOnce,
    Require,
    RequireOnce,
}

impl IncludeKind {
    pub fn is_once(&self) -> bool {
        matches!(self, IncludeKind::IncludeOnce | IncludeKind::RequireOnce)
    }

    pub fn is_require(&self) -> bool {
        matches!(self, IncludeKind::Require | IncludeKind::RequireOnce)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StringPart {
    Literal(String),
    /// `$name`, `$name->prop`, `$name[key]` or `{$expr}`.
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayItem {
    pub key: Option<Expr>,
    pub value: Expr,
}

/// Anonymous function or arrow function.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosureDecl {
    pub params: Vec<Param>,
    pub uses: Vec<String>,
    pub return_type: Option<String>,
    pub body: Rc<Vec<Stmt>>,
    /// `fn() => expr`: captures the whole enclosing scope by value.
    pub is_arrow: bool,
    pub is_static: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Interpolated(Vec<StringPart>),
    Array(Vec<ArrayItem>),
    Var(String),
    ConstFetch(String),
    ClassConstFetch {
        class: String,
        name: String,
    },
    StaticPropFetch {
        class: String,
        name: String,
    },
    Assign {
        target: Box<Expr>,
        op: Option<BinaryOp>,
        value: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    IncDec {
        target: Box<Expr>,
        increment: bool,
        prefix: bool,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
    CallValue {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    StaticCall {
        class: String,
        method: String,
        args: Vec<Expr>,
    },
    MethodCall {
        object: Box<Expr>,
        method: String,
        args: Vec<Expr>,
    },
    PropFetch {
        object: Box<Expr>,
        name: String,
    },
    /// `$a[$i]`, or `$a[]` when `index` is `None` (append target).
    Index {
        base: Box<Expr>,
        index: Option<Box<Expr>>,
    },
    New {
        class: String,
        args: Vec<Expr>,
    },
    Closure(Rc<ClosureDecl>),
    Include {
        kind: IncludeKind,
        path: Box<Expr>,
    },
    Exit(Option<Box<Expr>>),
    Ternary {
        cond: Box<Expr>,
        /// `None` for the short form `a ?: b`.
        then: Option<Box<Expr>>,
        otherwise: Box<Expr>,
    },
    Isset(Vec<Expr>),
    Empty(Box<Expr>),
    Instanceof {
        expr: Box<Expr>,
        class: String,
    },
    Throw(Box<Expr>),
    Print(Box<Expr>),
    Cast {
        ty: CastType,
        expr: Box<Expr>,
    },
    Match {
        subject: Box<Expr>,
        arms: Vec<MatchArm>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchArm {
    /// `None` for the `default` arm.
    pub conditions: Option<Vec<Expr>>,
    pub body: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastType {
    Int,
    Float,
    String,
    Bool,
    Array,
}

impl CastType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "int" | "integer" => Some(CastType::Int),
            "float" | "double" => Some(CastType::Float),
            "string" => Some(CastType::String),
            "bool" | "boolean" => Some(CastType::Bool),
            "array" => Some(CastType::Array),
            _ => None,
        }
    }
}

impl Expr {
    /// Whether the expression can appear on the left of `=`.
    pub fn is_assignable(&self) -> bool {
        matches!(
            self,
            Expr::Var(_)
                | Expr::Index { .. }
                | Expr::PropFetch { .. }
                | Expr::StaticPropFetch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_line_and_text() {
        let source = "<?php\n$a = 1;\necho $a;";
        let span = Span::new(14, 22);
        assert_eq!(span.line(source), 3);
        assert_eq!(span.text(source), "echo $a;");
    }

    #[test]
    fn test_control_bodies() {
        let stmt = |kind| Stmt {
            kind,
            span: Span::default(),
        };
        let flow = ControlFlow::If {
            cond: Expr::Bool(true),
            then: vec![stmt(StmtKind::Break)],
            elseifs: vec![(Expr::Bool(false), vec![])],
            otherwise: Some(vec![stmt(StmtKind::Continue)]),
        };
        assert_eq!(flow.kind(), "if");
        assert_eq!(flow.bodies().len(), 3);
    }

    #[test]
    fn test_use_visible_name() {
        let item = UseItem {
            name: r"App\Models\User".into(),
            alias: None,
        };
        assert_eq!(item.visible_name(), "User");
    }
}
