//! AST node definitions.
//!
//! Every node carries a span. Expressions additionally carry a parser
//! assigned [`ExprId`]; the semantic analyzer attaches types, coercions
//! and name resolutions to these ids in side tables rather than mutating
//! the tree.

use qbc_lex::NumLit;
use qbc_util::{Span, Symbol};

/// Dense id for an expression node, assigned in parse order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub u32);

/// A parsed module: a flat statement list plus file-level directives.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub stmts: Vec<Stmt>,
    /// `$CONSOLE` seen anywhere in the module.
    pub console: bool,
}

/// A statement with its source span.
#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

/// A reference to a jump target: `Foo:` labels and bare line numbers
/// share one canonical symbol form (`100` interns as "100").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelRef {
    pub name: Symbol,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    /// `Foo:` or a bare line number at the start of a logical line.
    Label(Symbol),
    Dim {
        shared: bool,
        decls: Vec<VarDecl>,
    },
    Redim {
        shared: bool,
        decls: Vec<VarDecl>,
    },
    /// `[LET] target = value`
    Assign {
        target: Expr,
        value: Expr,
    },
    Print {
        channel: Option<Expr>,
        items: Vec<PrintPiece>,
    },
    Input {
        channel: Option<Expr>,
        prompt: Option<Vec<u8>>,
        /// Suppress the `? ` prompt (`,` after the prompt string).
        no_question: bool,
        targets: Vec<Expr>,
    },
    LineInput {
        channel: Option<Expr>,
        prompt: Option<Vec<u8>>,
        no_question: bool,
        target: Expr,
    },
    /// `IF`/`ELSEIF` arms in source order, then the optional `ELSE` body.
    If {
        arms: Vec<IfArm>,
        else_body: Vec<Stmt>,
    },
    Select {
        subject: Expr,
        arms: Vec<CaseArm>,
        else_body: Option<Vec<Stmt>>,
    },
    For {
        counter: Expr,
        from: Expr,
        to: Expr,
        step: Option<Expr>,
        body: Vec<Stmt>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    DoLoop {
        pre: Option<LoopCond>,
        post: Option<LoopCond>,
        body: Vec<Stmt>,
    },
    Exit(ExitKind),
    Goto(LabelRef),
    Gosub(LabelRef),
    Return(Option<LabelRef>),
    Const {
        decls: Vec<ConstDecl>,
    },
    TypeDef {
        name: Symbol,
        fields: Vec<FieldDecl>,
    },
    Proc(ProcDef),
    Declare {
        kind: ProcKind,
        name: Symbol,
        params: Vec<Param>,
    },
    Call {
        name: Symbol,
        args: Vec<Expr>,
    },
    Open {
        path: Expr,
        mode: OpenMode,
        channel: Expr,
    },
    /// Empty channel list closes every open channel.
    Close {
        channels: Vec<Expr>,
    },
    Data {
        items: Vec<DataItem>,
    },
    Read {
        targets: Vec<Expr>,
    },
    Restore(Option<LabelRef>),
    Randomize(Option<Expr>),
    Swap(Expr, Expr),
    OptionBase(u8),
    Cls,
    Beep,
    Sleep(Option<Expr>),
    End,
    /// `$INCLUDE:'path'`, replaced by the driver with the included
    /// file's statements before analysis.
    Include(String),
}

#[derive(Debug, Clone)]
pub struct IfArm {
    pub cond: Expr,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct CaseArm {
    pub guards: Vec<CaseGuard>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum CaseGuard {
    /// `CASE v`
    Value(Expr),
    /// `CASE v TO w`
    Range(Expr, Expr),
    /// `CASE IS <relop> v`
    Is(BinOp, Expr),
}

#[derive(Debug, Clone)]
pub enum LoopCond {
    While(Expr),
    Until(Expr),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitKind {
    For,
    Do,
    Sub,
    Function,
}

#[derive(Debug, Clone)]
pub struct ConstDecl {
    pub name: Symbol,
    pub value: Expr,
    pub span: Span,
}

/// One declarator in a `DIM`/`REDIM` list.
#[derive(Debug, Clone)]
pub struct VarDecl {
    pub name: Symbol,
    /// `(bounds)` marks an array; each dimension is `[lower TO] upper`.
    pub dims: Option<Vec<DimBound>>,
    pub ty: Option<TypeName>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct DimBound {
    pub lower: Option<Expr>,
    pub upper: Expr,
}

/// A declared type, as written after `AS`.
#[derive(Debug, Clone)]
pub enum TypeName {
    Integer,
    Long,
    Integer64,
    UnsignedLong,
    Single,
    Double,
    /// `STRING` or `STRING * n`.
    String { fixed_len: Option<Expr> },
    /// A `TYPE ... END TYPE` record name.
    User(Symbol),
}

#[derive(Debug, Clone)]
pub struct FieldDecl {
    pub name: Symbol,
    pub ty: TypeName,
    pub span: Span,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcKind {
    Sub,
    Function,
}

#[derive(Debug, Clone)]
pub struct ProcDef {
    pub kind: ProcKind,
    pub name: Symbol,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: Symbol,
    pub ty: Option<TypeName>,
    /// `BYVAL`; parameters default to by-reference.
    pub by_val: bool,
    /// `name()`, a whole-array parameter.
    pub is_array: bool,
    pub span: Span,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    Input,
    Output,
    Append,
    Binary,
    Random,
}

/// One element of a `PRINT` item list.
#[derive(Debug, Clone)]
pub enum PrintPiece {
    Expr(Expr),
    /// `;`: no spacing, and suppresses the newline when trailing.
    Semi,
    /// `,`: advance to the next 14-column zone.
    Comma,
}

#[derive(Debug, Clone)]
pub enum DataItem {
    Number(NumLit, Span),
    Str(Vec<u8>, Span),
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Expr {
    pub id: ExprId,
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Number(NumLit),
    StringLit(Vec<u8>),
    /// A bare name: scalar variable, constant, or zero-argument function.
    Var(Symbol),
    /// `name(args)`: array element or function call; the semantic pass
    /// decides which from the name's declaration.
    Call {
        name: Symbol,
        args: Vec<Expr>,
    },
    /// Record field access, `base.FIELD`.
    Field {
        base: Box<Expr>,
        field: Symbol,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    IntDiv,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    pub fn is_relational(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }
}

impl Expr {
    /// Whether the expression has l-value shape (assignable syntax).
    /// Whether it is *actually* assignable is a semantic question.
    pub fn is_lvalue_shaped(&self) -> bool {
        match &self.kind {
            ExprKind::Var(_) | ExprKind::Call { .. } => true,
            ExprKind::Field { base, .. } => base.is_lvalue_shaped(),
            _ => false,
        }
    }
}
