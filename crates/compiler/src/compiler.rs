//! The single-pass compiler.
//!
//! A recursive-descent parser that emits register bytecode directly into the
//! prototype under construction; there is no AST. The machinery that makes
//! one pass sufficient:
//!
//! - **Lazy expressions.** Parsing produces an [`Expr`]: a constant, a
//!   location, a pending comparison, or a pending accessor. Constants fold
//!   at parse time; a comparison used only as a branch condition never
//!   materializes a boolean into a register.
//! - **Open-branch labels.** Short-circuit `&&`/`||` emit `test`/`testset`
//!   plus a placeholder jump whose instruction index is pushed onto the
//!   true or false label. Whoever closes the expression patches every open
//!   jump at once.
//! - **Temporaries.** `temp` is the next free register above the declared
//!   locals; expression compilation claims and releases temporaries in
//!   stack order.
//!
//! Transient buffers produced while folding string constants live in a
//! `bumpalo` arena recycled at top-level statement boundaries.

use bumpalo::Bump;

use koji_core::alloc::Heap;
use koji_core::bytecode::{Instr, Opcode, MAX_ABC};
use koji_core::class::Class;
use koji_core::object::value_destroy;
use koji_core::proto::{prototype_release, Prototype};
use koji_core::string::{string_from_bytes, Str};
use koji_core::value::Value;

use crate::error::{CompileError, Reporter, SourceLoc};
use crate::lexer::{Lexer, Token};
use crate::source::SourceReader;

/// A register/constant reference: non-negative values are frame registers,
/// negative values reference the constant pool (`index = -loc - 1`).
pub type Loc = i32;

/// Signature of a host static function, as seen by the compiler.
#[derive(Clone, Copy, Debug)]
pub struct StaticFnSig {
    /// Index into the host registry, burned into the bytecode as a numeric
    /// constant.
    pub index: i32,
    pub min_args: i32,
    pub max_args: i32,
}

/// Resolves identifiers to host static functions at compile time.
pub trait StaticFnResolver {
    fn lookup(&self, name: &str) -> Option<StaticFnSig>;
}

/// A resolver with no registered functions.
pub struct NoStaticFns;

impl StaticFnResolver for NoStaticFns {
    fn lookup(&self, _name: &str) -> Option<StaticFnSig> {
        None
    }
}

/// Everything a compilation run needs from the outside.
pub struct CompileInfo<'a> {
    pub source_name: &'a str,
    pub reader: Box<dyn SourceReader + 'a>,
    pub reporter: Reporter<'a>,
    pub heap: Heap,
    /// The string class, used to allocate string constants.
    pub cls_string: *mut Class,
    pub statics: &'a dyn StaticFnResolver,
}

/// A declared local: a name (as a range into the scope identifier buffer)
/// and the register reserved for it.
struct Local {
    id_offset: usize,
    id_len: usize,
    loc: Loc,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Lt,
    Lte,
}

impl CompareOp {
    fn opcode(self) -> Opcode {
        match self {
            CompareOp::Eq => Opcode::Eq,
            CompareOp::Lt => Opcode::Lt,
            CompareOp::Lte => Opcode::Lte,
        }
    }
}

/// The lazy expression representation.
#[derive(Clone, Copy)]
enum ExprKind<'b> {
    Nil,
    Bool(bool),
    Num(f64),
    Str(&'b [u8]),
    Loc(Loc),
    /// A comparison not yet materialized; used directly by branches.
    Compare { op: CompareOp, lhs: Loc, rhs: Loc },
    /// An indexing accessor `obj[key]`, kept symbolic so it can be used as
    /// an assignment target or a method-call receiver.
    Access { obj: Loc, key: Loc },
    /// The `globals` keyword; must be followed by a field access.
    Globals,
    /// `globals.name`, with the interned name constant.
    GlobalAccess { key: Loc },
}

#[derive(Clone, Copy)]
struct Expr<'b> {
    kind: ExprKind<'b>,
    /// Toggled by logical negation and De Morgan rewrites.
    positive: bool,
}

impl<'b> Expr<'b> {
    fn nil() -> Expr<'b> {
        Expr { kind: ExprKind::Nil, positive: true }
    }

    fn boolean(v: bool) -> Expr<'b> {
        Expr { kind: ExprKind::Bool(v), positive: true }
    }

    fn num(n: f64) -> Expr<'b> {
        Expr { kind: ExprKind::Num(n), positive: true }
    }

    fn str(bytes: &'b [u8]) -> Expr<'b> {
        Expr { kind: ExprKind::Str(bytes), positive: true }
    }

    fn loc(l: Loc) -> Expr<'b> {
        Expr { kind: ExprKind::Loc(l), positive: true }
    }

    fn compare(op: CompareOp, test_value: bool, lhs: Loc, rhs: Loc) -> Expr<'b> {
        Expr { kind: ExprKind::Compare { op, lhs, rhs }, positive: test_value }
    }

    fn is_const(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::Nil | ExprKind::Bool(_) | ExprKind::Num(_) | ExprKind::Str(_)
        )
    }

    fn is_compare(&self) -> bool {
        matches!(self.kind, ExprKind::Compare { .. })
    }

    /// Truthiness of a constant expression.
    fn to_bool(&self) -> bool {
        match self.kind {
            ExprKind::Nil => false,
            ExprKind::Bool(v) => v,
            ExprKind::Num(n) => n != 0.0,
            ExprKind::Str(_) => true,
            _ => unreachable!("to_bool on a non-constant expression"),
        }
    }

    fn type_name(&self) -> &'static str {
        match self.kind {
            ExprKind::Nil => "nil",
            ExprKind::Bool(_) => "bool",
            ExprKind::Num(_) => "number",
            ExprKind::Str(_) => "string",
            ExprKind::Loc(_) => "local",
            ExprKind::Compare { .. } => "bool",
            ExprKind::Access { .. } => "accessor",
            ExprKind::Globals | ExprKind::GlobalAccess { .. } => "global",
        }
    }
}

/// Binary operators, in precedence-table order.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Binop {
    Or,
    And,
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    BitOr,
    BitXor,
    BitAnd,
    Shl,
    Shr,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl Binop {
    fn from_token(tok: Token) -> Option<Binop> {
        match tok {
            Token::PipePipe => Some(Binop::Or),
            Token::AmpAmp => Some(Binop::And),
            Token::EqEq => Some(Binop::Eq),
            Token::NotEq => Some(Binop::Neq),
            Token::Less => Some(Binop::Lt),
            Token::LessEq => Some(Binop::Lte),
            Token::Greater => Some(Binop::Gt),
            Token::GreaterEq => Some(Binop::Gte),
            Token::Pipe => Some(Binop::BitOr),
            Token::Caret => Some(Binop::BitXor),
            Token::Amp => Some(Binop::BitAnd),
            Token::Shl => Some(Binop::Shl),
            Token::Shr => Some(Binop::Shr),
            Token::Plus => Some(Binop::Add),
            Token::Minus => Some(Binop::Sub),
            Token::Star => Some(Binop::Mul),
            Token::Slash => Some(Binop::Div),
            Token::Percent => Some(Binop::Mod),
            _ => None,
        }
    }

    fn precedence(self) -> i32 {
        match self {
            Binop::Or => 1,
            Binop::And => 2,
            Binop::Eq | Binop::Neq => 3,
            Binop::Lt | Binop::Lte | Binop::Gt | Binop::Gte => 4,
            Binop::BitOr => 5,
            Binop::BitXor => 6,
            Binop::BitAnd => 7,
            Binop::Shl | Binop::Shr => 8,
            Binop::Add | Binop::Sub => 9,
            Binop::Mul | Binop::Div | Binop::Mod => 10,
        }
    }

    fn is_comparison(self) -> bool {
        matches!(
            self,
            Binop::Eq | Binop::Neq | Binop::Lt | Binop::Lte | Binop::Gt | Binop::Gte
        )
    }

    /// Opcode of an arithmetic operator.
    fn arith_opcode(self) -> Opcode {
        match self {
            Binop::Add => Opcode::Add,
            Binop::Sub => Opcode::Sub,
            Binop::Mul => Opcode::Mul,
            Binop::Div => Opcode::Div,
            Binop::Mod => Opcode::Mod,
            _ => unreachable!("not an arithmetic operator"),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Binop::Or => "||",
            Binop::And => "&&",
            Binop::Eq => "==",
            Binop::Neq => "!=",
            Binop::Lt => "<",
            Binop::Lte => "<=",
            Binop::Gt => ">",
            Binop::Gte => ">=",
            Binop::BitOr => "|",
            Binop::BitXor => "^",
            Binop::BitAnd => "&",
            Binop::Shl => "<<",
            Binop::Shr => ">>",
            Binop::Add => "+",
            Binop::Sub => "-",
            Binop::Mul => "*",
            Binop::Div => "/",
            Binop::Mod => "%",
        }
    }
}

/// Open-branch bookkeeping for one (sub)expression: the first label entry
/// belonging to it on each side, and whether it is being parsed under a
/// logical negation.
#[derive(Clone, Copy)]
struct ExprState {
    true_branch_idx: usize,
    false_branch_idx: usize,
    negated: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Branch {
    True,
    False,
}

/// Compiler state for one compilation run.
struct Compiler<'a> {
    lex: Lexer<'a>,
    heap: Heap,
    cls_string: *mut Class,
    statics: &'a dyn StaticFnResolver,
    /// Identifier characters of all declared locals, in declaration order.
    scope_ids: Vec<u8>,
    locals: Vec<Local>,
    /// Index of the first local belonging to the current function; lookups
    /// never cross it (no upvalue capture).
    locals_base: usize,
    /// Next free register above the locals.
    temp: Loc,
    label_true: Vec<usize>,
    label_false: Vec<usize>,
    /// Stack of prototypes under construction; the last is current.
    protos: Vec<Prototype>,
}

/// Compiles a source stream into a prototype.
///
/// On error the partially-built prototype tree is freed and the issue has
/// already been delivered to the reporter.
pub fn compile(info: CompileInfo) -> Result<*mut Prototype, CompileError> {
    let lex = Lexer::new(info.source_name, info.reader, info.reporter)?;
    let mut c = Compiler {
        lex,
        heap: info.heap,
        cls_string: info.cls_string,
        statics: info.statics,
        scope_ids: Vec::new(),
        locals: Vec::new(),
        locals_base: 0,
        temp: 0,
        label_true: Vec::new(),
        label_false: Vec::new(),
        protos: vec![new_proto("@main")],
    };

    match c.parse_module() {
        Ok(()) => {
            let main = c.protos.pop().expect("prototype stack is never empty");
            debug_assert!(c.protos.is_empty());
            tracing::debug!(
                instrs = main.instrs.len(),
                consts = main.consts.len(),
                nlocals = main.nlocals,
                "compiled module"
            );
            Ok(Box::into_raw(Box::new(main)))
        }
        Err(err) => {
            // Free the partially-built prototype tree: children are owned
            // by their parents, in-progress prototypes by the stack.
            for proto in c.protos.drain(..) {
                for &child in &proto.protos {
                    unsafe { prototype_release(child, &c.heap) };
                }
                for &constant in &proto.consts {
                    value_destroy(&c.heap, constant);
                }
            }
            Err(err)
        }
    }
}

fn new_proto(name: &str) -> Prototype {
    Prototype {
        refs: std::cell::Cell::new(1),
        name: name.to_string(),
        nargs: 0,
        nlocals: 0,
        consts: Vec::new(),
        instrs: Vec::new(),
        protos: Vec::new(),
    }
}

impl<'a> Compiler<'a> {
    // ------------------------------------------------------------------
    // parsing helpers
    // ------------------------------------------------------------------

    fn advance(&mut self) -> Result<Token, CompileError> {
        self.lex.scan()
    }

    fn peek(&self, tok: Token) -> bool {
        self.lex.tok == tok
    }

    fn accept(&mut self, tok: Token) -> Result<bool, CompileError> {
        if self.peek(tok) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn check(&mut self, tok: Token) -> Result<(), CompileError> {
        if !self.peek(tok) {
            let loc = self.lex.loc.clone();
            let message = format!("missing {} before '{}'.", tok, self.lex.ahead_str());
            return Err(self.lex.issues.error(&loc, message));
        }
        Ok(())
    }

    fn expect(&mut self, tok: Token) -> Result<(), CompileError> {
        self.check(tok)?;
        self.advance()?;
        Ok(())
    }

    fn error_at(&mut self, loc: &SourceLoc, message: impl AsRef<str>) -> CompileError {
        self.lex.issues.error(loc, message)
    }

    fn error_syntax_at(&mut self, loc: &SourceLoc) -> CompileError {
        let message = format!("unexpected '{}'.", self.lex.ahead_str());
        self.lex.issues.error(loc, message)
    }

    fn error_syntax(&mut self) -> CompileError {
        let loc = self.lex.loc.clone();
        self.error_syntax_at(&loc)
    }

    /// Consumes an end of statement: a `;`, a closing brace or end of
    /// stream (peeked, not eaten), or a preceding newline.
    fn accept_end_of_stmt(&mut self) -> Result<bool, CompileError> {
        if self.accept(Token::Semicolon)? {
            return Ok(true);
        }
        if self.peek(Token::RBrace) || self.peek(Token::Eos) {
            return Ok(true);
        }
        if self.lex.newline {
            self.lex.newline = false;
            return Ok(true);
        }
        Ok(false)
    }

    fn expect_end_of_stmt(&mut self) -> Result<(), CompileError> {
        if !self.accept_end_of_stmt()? {
            return Err(self.error_syntax());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // prototype / register / label plumbing
    // ------------------------------------------------------------------

    fn proto(&mut self) -> &mut Prototype {
        self.protos.last_mut().expect("prototype stack is never empty")
    }

    fn ninstrs(&self) -> usize {
        self.protos
            .last()
            .expect("prototype stack is never empty")
            .instrs
            .len()
    }

    /// Pushes an instruction, maintaining the register high-water mark. A
    /// `testset` still carrying the placeholder target is not counted; its
    /// real register is recorded when the target is patched in.
    fn emit(&mut self, instr: Instr) {
        let proto = self.proto();
        let op = instr.op();
        if op.has_target() && !(op == Opcode::TestSet && instr.a() == MAX_ABC) {
            proto.nlocals = proto.nlocals.max(instr.a() + 1);
        }
        proto.instrs.push(instr);
    }

    /// Patches the target register of a pending `testset`.
    fn retarget_testset(&mut self, index: usize, target: Loc) {
        let proto = self.proto();
        proto.instrs[index].set_a(target);
        proto.nlocals = proto.nlocals.max(target + 1);
    }

    /// Offset from the jump at `from` to the next instruction emitted.
    fn offset_to_next(&self, from: usize) -> i32 {
        self.ninstrs() as i32 - from as i32 - 1
    }

    /// Claims one more temporary register.
    fn bump_temp(&mut self) -> Result<(), CompileError> {
        if self.temp >= MAX_ABC {
            let loc = self.lex.loc.clone();
            return Err(self.error_at(&loc, "function uses too many registers."));
        }
        self.temp += 1;
        Ok(())
    }

    /// If `e` sits in the current free temporary, claims it. Returns the
    /// previous `temp`, to be restored by the caller.
    fn use_temp(&mut self, e: &Expr) -> Result<Loc, CompileError> {
        let old = self.temp;
        if let ExprKind::Loc(l) = e.kind {
            if l == self.temp {
                self.bump_temp()?;
            }
        }
        Ok(old)
    }

    fn label(&mut self, which: Branch) -> &mut Vec<usize> {
        match which {
            Branch::True => &mut self.label_true,
            Branch::False => &mut self.label_false,
        }
    }

    fn label_len(&self, which: Branch) -> usize {
        match which {
            Branch::True => self.label_true.len(),
            Branch::False => self.label_false.len(),
        }
    }

    /// Patches all jumps of `which` from `first` on to `target`, then
    /// drops them from the label. A preceding `testset` that never received
    /// a real target register (its A operand is still the placeholder) is
    /// demoted to a plain `test`: branch-only contexts have no value to
    /// set.
    fn label_bind(&mut self, which: Branch, first: usize, target: usize) {
        for i in first..self.label_len(which) {
            let jump_idx = match which {
                Branch::True => self.label_true[i],
                Branch::False => self.label_false[i],
            };
            if jump_idx > 0 {
                let prev = self.proto().instrs[jump_idx - 1];
                if prev.op() == Opcode::TestSet && prev.a() == MAX_ABC {
                    self.proto().instrs[jump_idx - 1] =
                        Instr::abx(Opcode::Test, prev.b(), prev.c());
                }
            }
            let offset = target as i32 - jump_idx as i32 - 1;
            self.proto().instrs[jump_idx].set_jump_offset(offset);
        }
        self.label(which).truncate(first);
    }

    fn label_bind_here(&mut self, which: Branch, first: usize) {
        let here = self.ninstrs();
        self.label_bind(which, first, here);
    }

    fn make_expr_state(&self, negated: bool) -> ExprState {
        ExprState {
            true_branch_idx: self.label_true.len(),
            false_branch_idx: self.label_false.len(),
            negated,
        }
    }

    // ------------------------------------------------------------------
    // scope
    // ------------------------------------------------------------------

    /// Copies the current identifier lookahead into the scope buffer.
    fn push_scope_id(&mut self) -> (usize, usize) {
        let offset = self.scope_ids.len();
        self.scope_ids.extend_from_slice(&self.lex.tokstr);
        (offset, self.lex.tokstr.len())
    }

    /// Declares a local bound to the next free register.
    fn push_local(&mut self, id: (usize, usize)) -> Result<(), CompileError> {
        self.locals.push(Local {
            id_offset: id.0,
            id_len: id.1,
            loc: self.temp,
        });
        self.bump_temp()
    }

    /// Looks up `id` among the current function's locals.
    fn fetch_local(&self, id: &[u8]) -> Option<Loc> {
        for local in self.locals[self.locals_base..].iter().rev() {
            let name = &self.scope_ids[local.id_offset..local.id_offset + local.id_len];
            if name == id {
                return Some(local.loc);
            }
        }
        None
    }

    /// Number of registers holding the current function's locals.
    fn nlocal_regs(&self) -> Loc {
        (self.locals.len() - self.locals_base) as Loc
    }

    // ------------------------------------------------------------------
    // constants
    // ------------------------------------------------------------------

    /// Interns a numeric constant by bit pattern.
    fn const_fetch_num(&mut self, num: f64) -> Result<i32, CompileError> {
        let value = Value::number(num);
        let proto = self.proto();
        for (i, c) in proto.consts.iter().enumerate() {
            if c.bits() == value.bits() {
                return Ok(i as i32);
            }
        }
        self.push_const(value)
    }

    /// Interns a string constant by content.
    fn const_fetch_str(&mut self, chars: &[u8]) -> Result<i32, CompileError> {
        let cls_string = self.cls_string;
        let proto = self.proto();
        for (i, c) in proto.consts.iter().enumerate() {
            if !c.is_object() {
                continue;
            }
            let obj = c.as_object();
            if unsafe { (*obj).class } != cls_string {
                continue;
            }
            if unsafe { Str::bytes(obj.cast()) } == chars {
                return Ok(i as i32);
            }
        }
        let str_ptr = string_from_bytes(&self.heap, cls_string, chars);
        if str_ptr.is_null() {
            let loc = self.lex.loc.clone();
            return Err(self.error_at(&loc, "out of memory."));
        }
        let value = unsafe { Value::object(str_ptr.cast()) };
        self.push_const(value)
    }

    fn push_const(&mut self, value: Value) -> Result<i32, CompileError> {
        let proto = self.proto();
        if proto.consts.len() > u16::MAX as usize {
            let loc = self.lex.loc.clone();
            return Err(self.error_at(&loc, "too many constants in function."));
        }
        proto.consts.push(value);
        Ok(self.proto().consts.len() as i32 - 1)
    }

    // ------------------------------------------------------------------
    // expression compilation
    // ------------------------------------------------------------------

    /// Emits whatever instructions make the value of `e` observable at a
    /// location: `target_hint` if instructions were needed, the value's own
    /// location otherwise. Returns that location.
    fn expr_compile(&mut self, e: Expr, target_hint: Loc) -> Result<Loc, CompileError> {
        match e.kind {
            ExprKind::Nil => {
                self.emit(Instr::abx(Opcode::LoadNil, target_hint, target_hint));
                Ok(target_hint)
            }
            ExprKind::Bool(v) => {
                self.emit(Instr::abc(Opcode::LoadBool, target_hint, v as i32, 0));
                Ok(target_hint)
            }
            ExprKind::Num(n) => {
                let index = self.const_fetch_num(n)?;
                self.make_const(index, target_hint)
            }
            ExprKind::Str(s) => {
                let index = self.const_fetch_str(s)?;
                self.make_const(index, target_hint)
            }
            ExprKind::Loc(l) => {
                if e.positive {
                    Ok(l)
                } else {
                    self.emit(Instr::abx(Opcode::Neg, target_hint, l));
                    Ok(target_hint)
                }
            }
            ExprKind::Compare { op, lhs, rhs } => {
                // Materialize the comparison as a bool via a loadbool pair.
                self.emit(Instr::abc(op.opcode(), lhs, rhs, e.positive as i32));
                self.emit(Instr::jump(1));
                self.emit(Instr::abc(Opcode::LoadBool, target_hint, 0, 1));
                self.emit(Instr::abc(Opcode::LoadBool, target_hint, 1, 0));
                Ok(target_hint)
            }
            ExprKind::Access { obj, key } => {
                self.emit(Instr::abc(Opcode::Get, target_hint, obj, key));
                if !e.positive {
                    self.emit(Instr::abx(Opcode::Neg, target_hint, target_hint));
                }
                Ok(target_hint)
            }
            ExprKind::GlobalAccess { key } => {
                self.emit(Instr::abx(Opcode::GetGlob, target_hint, key));
                if !e.positive {
                    self.emit(Instr::abx(Opcode::Neg, target_hint, target_hint));
                }
                Ok(target_hint)
            }
            ExprKind::Globals => {
                let loc = self.lex.loc.clone();
                Err(self.error_at(&loc, "'globals' must be followed by a field access."))
            }
        }
    }

    /// Direct-index constants when they fit in a signed 9-bit operand,
    /// otherwise a move into the target register.
    fn make_const(&mut self, index: i32, target_hint: Loc) -> Result<Loc, CompileError> {
        let loc = -index - 1;
        if index <= MAX_ABC {
            Ok(loc)
        } else {
            self.emit(Instr::abx(Opcode::Mov, target_hint, loc));
            Ok(target_hint)
        }
    }

    /// Logical negation: constants fold, everything else flips `positive`.
    fn expr_negate<'b>(&self, e: Expr<'b>) -> Expr<'b> {
        match e.kind {
            ExprKind::Nil => Expr::boolean(true),
            ExprKind::Bool(v) => Expr::boolean(!v),
            ExprKind::Num(n) => Expr::boolean(n == 0.0),
            ExprKind::Str(_) => Expr::boolean(false),
            _ => Expr { kind: e.kind, positive: !e.positive },
        }
    }

    /// Unary minus: numeric constants fold, locations emit `unm`.
    fn expr_compile_unm<'b>(
        &mut self,
        sloc: &SourceLoc,
        e: Expr<'b>,
    ) -> Result<Expr<'b>, CompileError> {
        match e.kind {
            ExprKind::Num(n) => Ok(Expr::num(-n)),
            ExprKind::Loc(_) | ExprKind::Access { .. } | ExprKind::GlobalAccess { .. } => {
                let l = self.expr_compile(e, self.temp)?;
                self.emit(Instr::abx(Opcode::Unm, self.temp, l));
                Ok(Expr::loc(self.temp))
            }
            _ => {
                let message = format!(
                    "cannot apply operator unary minus to a value of type {}.",
                    e.type_name()
                );
                Err(self.error_at(sloc, message))
            }
        }
    }

    /// Compiles a binary operation, folding constants where the rules
    /// allow, otherwise emitting the arithmetic instruction or building a
    /// pending comparison.
    fn expr_compile_binary<'b>(
        &mut self,
        sloc: &SourceLoc,
        op: Binop,
        lhs: Expr<'b>,
        rhs: Expr<'b>,
        arena: &'b Bump,
    ) -> Result<Expr<'b>, CompileError> {
        use ExprKind::*;

        // Logical operators: the branching side effects happened in
        // `compile_logical_op`; here only constant folding remains.
        match op {
            Binop::And => {
                return Ok(if lhs.is_const() && !lhs.to_bool() {
                    Expr::boolean(false)
                } else {
                    rhs
                });
            }
            Binop::Or => {
                return Ok(if lhs.is_const() && lhs.to_bool() {
                    Expr::boolean(true)
                } else {
                    rhs
                });
            }
            _ => {}
        }

        match op {
            Binop::Add => {
                if let (Str(a), Str(b)) = (lhs.kind, rhs.kind) {
                    let joined = arena.alloc_slice_fill_copy(a.len() + b.len(), 0u8);
                    joined[..a.len()].copy_from_slice(a);
                    joined[a.len()..].copy_from_slice(b);
                    return Ok(Expr::str(joined));
                }
                if !Compiler::str_mixes_with_runtime(&lhs, &rhs) {
                    self.check_arith_operands(sloc, op, &lhs, &rhs)?;
                    if let (Num(a), Num(b)) = (lhs.kind, rhs.kind) {
                        return Ok(Expr::num(a + b));
                    }
                }
            }
            Binop::Mul => {
                if let (Str(a), Num(n)) = (lhs.kind, rhs.kind) {
                    let count = n as i64;
                    if count < 0 {
                        return Err(self.error_at(
                            sloc,
                            "cannot multiply a string by a negative number.",
                        ));
                    }
                    let total = a.len() * count as usize;
                    let repeated = arena.alloc_slice_fill_copy(total, 0u8);
                    for i in 0..count as usize {
                        repeated[i * a.len()..(i + 1) * a.len()].copy_from_slice(a);
                    }
                    return Ok(Expr::str(repeated));
                }
                if !Compiler::str_mixes_with_runtime(&lhs, &rhs) {
                    self.check_arith_operands(sloc, op, &lhs, &rhs)?;
                    if let (Num(a), Num(b)) = (lhs.kind, rhs.kind) {
                        return Ok(Expr::num(a * b));
                    }
                }
            }
            Binop::Sub => {
                self.check_arith_operands(sloc, op, &lhs, &rhs)?;
                if let (Num(a), Num(b)) = (lhs.kind, rhs.kind) {
                    return Ok(Expr::num(a - b));
                }
            }
            Binop::Div => {
                self.check_arith_operands(sloc, op, &lhs, &rhs)?;
                if let (Num(a), Num(b)) = (lhs.kind, rhs.kind) {
                    return Ok(Expr::num(a / b));
                }
            }
            Binop::Mod => {
                self.check_arith_operands(sloc, op, &lhs, &rhs)?;
                if let (Num(a), Num(b)) = (lhs.kind, rhs.kind) {
                    let result = if b as i64 == 0 {
                        return Err(self.error_at(sloc, "modulo by zero."));
                    } else {
                        (a as i64) % (b as i64)
                    };
                    return Ok(Expr::num(result as f64));
                }
            }
            Binop::Shl | Binop::Shr | Binop::BitAnd | Binop::BitOr | Binop::BitXor => {
                if let (Num(a), Num(b)) = (lhs.kind, rhs.kind) {
                    let (a, b) = (a as i64, b as i64);
                    let result = match op {
                        Binop::Shl => a.wrapping_shl(b as u32 & 63),
                        Binop::Shr => a.wrapping_shr(b as u32 & 63),
                        Binop::BitAnd => a & b,
                        Binop::BitOr => a | b,
                        Binop::BitXor => a ^ b,
                        _ => unreachable!(),
                    };
                    return Ok(Expr::num(result as f64));
                }
                if lhs.is_const() && rhs.is_const() {
                    return Err(self.binary_type_error(sloc, op, &lhs, &rhs));
                }
                let message =
                    format!("operator '{}' is not supported on runtime values.", op.name());
                return Err(self.error_at(sloc, message));
            }
            Binop::Eq | Binop::Neq => {
                let invert = op == Binop::Neq;
                // Comparing anything against nil is settled at compile time.
                if matches!(lhs.kind, Nil) || matches!(rhs.kind, Nil) {
                    let result = matches!(lhs.kind, Nil) == matches!(rhs.kind, Nil);
                    return Ok(Expr::boolean(result ^ invert));
                }
                if lhs.is_const() && rhs.is_const() {
                    return match (lhs.kind, rhs.kind) {
                        (Bool(a), Bool(b)) => Ok(Expr::boolean((a == b) ^ invert)),
                        (Num(a), Num(b)) => Ok(Expr::boolean((a == b) ^ invert)),
                        (Str(a), Str(b)) => Ok(Expr::boolean((a == b) ^ invert)),
                        _ => Err(self.binary_type_error(sloc, op, &lhs, &rhs)),
                    };
                }
            }
            Binop::Lt | Binop::Gte => {
                let invert = op == Binop::Gte;
                if matches!(lhs.kind, Nil) {
                    // nil orders below everything.
                    return Ok(Expr::boolean(matches!(rhs.kind, Nil) == invert));
                }
                if matches!(rhs.kind, Nil) {
                    return Ok(Expr::boolean(invert));
                }
                if lhs.is_const() && rhs.is_const() {
                    return match (lhs.kind, rhs.kind) {
                        (Bool(a), Bool(b)) => Ok(Expr::boolean((!a & b) ^ invert)),
                        (Num(a), Num(b)) => Ok(Expr::boolean((a < b) ^ invert)),
                        (Str(a), Str(b)) => {
                            let lt = a.len() < b.len() || (a.len() == b.len() && a < b);
                            Ok(Expr::boolean(lt ^ invert))
                        }
                        _ => Err(self.binary_type_error(sloc, op, &lhs, &rhs)),
                    };
                }
            }
            Binop::Lte | Binop::Gt => {
                let invert = op == Binop::Gt;
                if matches!(lhs.kind, Nil) {
                    return Ok(Expr::boolean(!invert));
                }
                if matches!(rhs.kind, Nil) {
                    return Ok(Expr::boolean(matches!(lhs.kind, Nil) != invert));
                }
                if lhs.is_const() && rhs.is_const() {
                    return match (lhs.kind, rhs.kind) {
                        (Bool(a), Bool(b)) => Ok(Expr::boolean((a <= b) ^ invert)),
                        (Num(a), Num(b)) => Ok(Expr::boolean((a <= b) ^ invert)),
                        (Str(a), Str(b)) => {
                            let lte =
                                a.len() < b.len() || (a.len() == b.len() && a <= b);
                            Ok(Expr::boolean(lte ^ invert))
                        }
                        _ => Err(self.binary_type_error(sloc, op, &lhs, &rhs)),
                    };
                }
            }
            Binop::And | Binop::Or => unreachable!("handled above"),
        }

        // One side is only known at runtime: compile both to locations and
        // emit the operation.
        let mut lhs_loc = self.expr_compile(lhs, self.temp)?;
        if op.is_comparison() && lhs_loc < 0 {
            // The comparison A-operand can only name a register.
            self.emit(Instr::abx(Opcode::Mov, self.temp, lhs_loc));
            lhs_loc = self.temp;
        }
        let lhs_c = Expr::loc(lhs_loc);
        let old_temp = self.use_temp(&lhs_c)?;
        let rhs_loc = self.expr_compile(rhs, self.temp)?;
        self.temp = old_temp;

        if op.is_comparison() {
            let (cmp, test_value) = match op {
                Binop::Lt => (CompareOp::Lt, true),
                Binop::Lte => (CompareOp::Lte, true),
                Binop::Gt => (CompareOp::Lte, false),
                Binop::Gte => (CompareOp::Lt, false),
                Binop::Eq => (CompareOp::Eq, true),
                Binop::Neq => (CompareOp::Eq, false),
                _ => unreachable!(),
            };
            Ok(Expr::compare(cmp, test_value, lhs_loc, rhs_loc))
        } else {
            self.emit(Instr::abc(op.arith_opcode(), self.temp, lhs_loc, rhs_loc));
            Ok(Expr::loc(self.temp))
        }
    }

    /// A string operand beside a runtime operand compiles to bytecode (the
    /// runtime type is unknown); neither folds nor errors here.
    fn str_mixes_with_runtime(lhs: &Expr, rhs: &Expr) -> bool {
        let runtime = |e: &Expr| !e.is_const();
        matches!(lhs.kind, ExprKind::Str(_)) && runtime(rhs)
            || matches!(rhs.kind, ExprKind::Str(_)) && runtime(lhs)
    }

    /// Arithmetic on nil, bool or (remaining) string constants is a
    /// compile-time error.
    fn check_arith_operands(
        &mut self,
        sloc: &SourceLoc,
        op: Binop,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<(), CompileError> {
        let bad = |e: &Expr| {
            matches!(e.kind, ExprKind::Nil | ExprKind::Bool(_) | ExprKind::Str(_))
        };
        if bad(lhs) || bad(rhs) {
            return Err(self.binary_type_error(sloc, op, lhs, rhs));
        }
        Ok(())
    }

    fn binary_type_error(
        &mut self,
        sloc: &SourceLoc,
        op: Binop,
        lhs: &Expr,
        rhs: &Expr,
    ) -> CompileError {
        let message = format!(
            "cannot make binary operation '{}' between values of type '{}' and '{}'.",
            op.name(),
            lhs.type_name(),
            rhs.type_name()
        );
        self.error_at(sloc, message)
    }

    /// Compiles the lhs of a logical `&&`/`||` before its rhs is parsed:
    /// emits the test (or comparison) and a placeholder jump, pushes the
    /// jump on the label matching the tested truth value, and redirects the
    /// opposite side's pending jumps to "keep testing" here. Pending
    /// `testset`s on that side lose their set and become plain `test`s.
    fn compile_logical_op(
        &mut self,
        es: &ExprState,
        op: Binop,
        lhs: Expr,
    ) -> Result<(), CompileError> {
        let is_loc = matches!(lhs.kind, ExprKind::Loc(_));
        if (!is_loc && !lhs.is_compare()) || (op != Binop::And && op != Binop::Or) {
            return Ok(());
        }

        let test_value = (op == Binop::Or) ^ es.negated;

        match lhs.kind {
            ExprKind::Loc(l) => {
                if !lhs.positive == es.negated {
                    self.emit(Instr::abc(Opcode::TestSet, MAX_ABC, l, test_value as i32));
                } else {
                    debug_assert!(l >= 0);
                    self.emit(Instr::abx(Opcode::Test, l, !test_value as i32));
                }
            }
            ExprKind::Compare { op: cmp, lhs: cl, rhs: cr } => {
                let result = (lhs.positive ^ es.negated) ^ !test_value;
                self.emit(Instr::abc(cmp.opcode(), cl, cr, result as i32));
            }
            _ => unreachable!(),
        }

        let jump_idx = self.ninstrs();
        let side = if test_value { Branch::True } else { Branch::False };
        self.label(side).push(jump_idx);
        self.emit(Instr::jump(0));

        // The other side must keep testing: its pending jumps land here.
        let (other, begin) = if test_value {
            (Branch::False, es.false_branch_idx)
        } else {
            (Branch::True, es.true_branch_idx)
        };
        while self.label_len(other) > begin {
            let index = *self.label(other).last().expect("label checked non-empty");
            if index > 0 && self.proto().instrs[index - 1].op() == Opcode::TestSet {
                let prev = self.proto().instrs[index - 1];
                let test_loc = prev.b();
                let flag = prev.c();
                self.proto().instrs[index - 1] = Instr::abx(Opcode::Test, test_loc, flag);
            }
            let offset = self.offset_to_next(index);
            self.proto().instrs[index].set_jump_offset(offset);
            let _ = self.label(other).pop();
        }
        Ok(())
    }

    /// Closes an expression: compiles it to a location, resolves every open
    /// branch belonging to it (patching `testset` targets, emitting
    /// `loadbool` pairs where a boolean value must exist), and restores the
    /// label state. With `move_to_target` the result is forced into
    /// `target_hint`.
    fn expr_close<'b>(
        &mut self,
        es: &ExprState,
        expr: Expr<'b>,
        target_hint: Loc,
        move_to_target: bool,
    ) -> Result<Expr<'b>, CompileError> {
        let true_begin = es.true_branch_idx;
        let false_begin = es.false_branch_idx;
        let value_is_compare = expr.is_compare();
        let mut target_loc = target_hint;
        let mut rhs_move_jump_idx = 0usize;
        let mut set_value_to_true = false;
        let mut set_value_to_false = false;
        let mut load_false_instr_idx = 0usize;
        let mut done = false;

        if let ExprKind::Compare { op, lhs, rhs } = expr.kind {
            self.emit(Instr::abc(op.opcode(), lhs, rhs, expr.positive as i32));
            let idx = self.ninstrs();
            self.label(Branch::True).push(idx);
            self.emit(Instr::jump(0));
            set_value_to_false = true;
        } else {
            target_loc = self.expr_compile(expr, target_hint)?;

            if move_to_target && target_loc != target_hint {
                let mut moved = false;
                if target_loc >= self.temp {
                    // The value lives in a temporary: retarget the emitting
                    // instruction instead of moving. Calls are excluded (their
                    // A operand is the frame base, not a plain destination),
                    // as is the register range of loadnil.
                    let proto = self.proto();
                    if let Some(last) = proto.instrs.last_mut() {
                        let op = last.op();
                        let plain_destination = op.has_target()
                            && !matches!(
                                op,
                                Opcode::Scall
                                    | Opcode::Call
                                    | Opcode::Mcall
                                    | Opcode::LoadNil
                            );
                        if plain_destination && last.a() == target_loc {
                            last.set_a(target_hint);
                            moved = true;
                        }
                    }
                }
                if !moved {
                    self.emit(Instr::abx(Opcode::Mov, target_hint, target_loc));
                }
                target_loc = target_hint;
            }

            if self.label_true.len() <= true_begin && self.label_false.len() <= false_begin
            {
                done = true;
            } else {
                rhs_move_jump_idx = self.ninstrs();
                self.emit(Instr::jump(0));
            }
        }

        if !done {
            // Branches to false: testsets get their target, plain jumps
            // require a `loadbool false`.
            for i in false_begin..self.label_false.len() {
                let index = self.label_false[i];
                if index > 0 {
                    if self.proto().instrs[index - 1].op() == Opcode::TestSet {
                        self.retarget_testset(index - 1, target_hint);
                    } else {
                        set_value_to_false = true;
                        let offset = self.offset_to_next(index);
                        self.proto().instrs[index].set_jump_offset(offset);
                    }
                }
            }
            if set_value_to_false {
                load_false_instr_idx = self.ninstrs();
                self.emit(Instr::abc(Opcode::LoadBool, target_hint, 0, 0));
            }

            // Same for branches to true.
            for i in true_begin..self.label_true.len() {
                let index = self.label_true[i];
                if index > 0 {
                    if self.proto().instrs[index - 1].op() == Opcode::TestSet {
                        self.retarget_testset(index - 1, target_hint);
                    } else {
                        set_value_to_true = true;
                        let offset = self.offset_to_next(index);
                        self.proto().instrs[index].set_jump_offset(offset);
                    }
                }
            }
            if set_value_to_true {
                self.emit(Instr::abc(Opcode::LoadBool, target_hint, 1, 0));
            }
            if set_value_to_false {
                let offset = self.offset_to_next(load_false_instr_idx);
                self.proto().instrs[load_false_instr_idx].set_c(offset);
            }

            if !value_is_compare {
                if !set_value_to_true && !set_value_to_false {
                    // No loadbool was needed after all: drop the jump that
                    // was meant to skip them.
                    let _ = self.proto().instrs.pop();
                } else {
                    let offset = self.offset_to_next(rhs_move_jump_idx);
                    self.proto().instrs[rhs_move_jump_idx].set_jump_offset(offset);
                }
            }

            // Remaining testset jumps short-circuit to the end.
            for i in true_begin..self.label_true.len() {
                let index = self.label_true[i];
                if index > 0 && self.proto().instrs[index - 1].op() == Opcode::TestSet {
                    let offset = self.offset_to_next(index);
                    self.proto().instrs[index].set_jump_offset(offset);
                }
            }
            for i in false_begin..self.label_false.len() {
                let index = self.label_false[i];
                if index > 0 && self.proto().instrs[index - 1].op() == Opcode::TestSet {
                    let offset = self.offset_to_next(index);
                    self.proto().instrs[index].set_jump_offset(offset);
                }
            }
        }

        self.label_true.truncate(true_begin);
        self.label_false.truncate(false_begin);
        Ok(Expr::loc(target_loc))
    }

    // ------------------------------------------------------------------
    // expression parsing
    // ------------------------------------------------------------------

    /// Parses a full expression into a fresh state and closes it.
    fn parse_exprto<'b>(
        &mut self,
        target_hint: Loc,
        move_to_target: bool,
        arena: &'b Bump,
    ) -> Result<Expr<'b>, CompileError> {
        let mut es = self.make_expr_state(false);
        let expr = self.parse_expr(&mut es, arena)?;
        self.expr_close(&es, expr, target_hint, move_to_target)
    }

    /// Parses a parenthesized subexpression. The subexpression is closed
    /// eagerly when an operator that would consume its value follows.
    fn parse_subexpr<'b>(
        &mut self,
        es: &ExprState,
        arena: &'b Bump,
    ) -> Result<Expr<'b>, CompileError> {
        let mut sub_es = *es;
        self.advance()?; // eat the '('
        let expr = self.parse_expr(&mut sub_es, arena)?;
        self.expect(Token::RParen)?;
        match self.lex.tok {
            Token::Plus
            | Token::Minus
            | Token::Star
            | Token::Slash
            | Token::LParen
            | Token::Amp
            | Token::Pipe
            | Token::LBracket => self.expr_close(&sub_es, expr, self.temp, false),
            _ => Ok(expr),
        }
    }

    /// Copies the current identifier lookahead into the arena as a string
    /// expression payload.
    fn scan_id_expr<'b>(&mut self, arena: &'b Bump) -> Result<Expr<'b>, CompileError> {
        debug_assert_eq!(self.lex.tok, Token::Identifier);
        let bytes = arena.alloc_slice_copy(&self.lex.tokstr);
        self.advance()?;
        Ok(Expr::str(bytes))
    }

    /// Parses a table literal `{ k1: v1, [e]: v2, v3, ... }`.
    fn parse_table<'b>(&mut self, arena: &'b Bump) -> Result<Expr<'b>, CompileError> {
        debug_assert!(self.peek(Token::LBrace));
        self.advance()?;

        let expr = Expr::loc(self.temp);
        let old_temp = self.use_temp(&expr)?;
        let table_loc = match expr.kind {
            ExprKind::Loc(l) => l,
            _ => unreachable!(),
        };
        self.emit(Instr::abx(Opcode::NewTable, table_loc, 0));

        if !self.peek(Token::RBrace) {
            let mut index = 0i32;
            let mut has_key = false;
            loop {
                let mut key;
                if self.peek(Token::Identifier) {
                    let id = self.scan_id_expr(arena)?;
                    let l = self.expr_compile(id, self.temp)?;
                    key = Expr::loc(l);
                    self.expect(Token::Colon)?;
                    has_key = true;
                } else {
                    let sloc = self.lex.loc.clone();
                    let square_bracket = self.accept(Token::LBracket)?;
                    key = self.parse_exprto(self.temp, false, arena)?;
                    if square_bracket {
                        self.expect(Token::RBracket)?;
                    }
                    if self.accept(Token::Colon)? {
                        has_key = true;
                    } else if has_key {
                        return Err(self.error_at(
                            &sloc,
                            "cannot leave key undefined after table entry with explicit key.",
                        ));
                    }
                }

                let old_temp2 = self.use_temp(&key)?;
                let value;
                if has_key {
                    value = self.parse_exprto(self.temp, false, arena)?;
                } else {
                    value = key;
                    let l = self.expr_compile(Expr::num(index as f64), self.temp)?;
                    key = Expr::loc(l);
                    index += 1;
                }
                self.temp = old_temp2;

                let key_loc = self.loc_of(&key);
                let value_loc = self.loc_of(&value);
                self.emit(Instr::abc(Opcode::Set, table_loc, key_loc, value_loc));

                if !self.accept(Token::Comma)? {
                    break;
                }
            }
        }
        self.expect(Token::RBrace)?;
        self.temp = old_temp;
        Ok(Expr::loc(table_loc))
    }

    fn loc_of(&self, e: &Expr) -> Loc {
        match e.kind {
            ExprKind::Loc(l) => l,
            _ => unreachable!("expression was not compiled to a location"),
        }
    }

    /// Parses `(arg1, arg2, ...)` into consecutive temporaries; returns the
    /// argument count. The caller restores `temp`.
    fn parse_call_args(&mut self, arena: &Bump) -> Result<i32, CompileError> {
        self.expect(Token::LParen)?;
        let mut nargs = 0;
        if !self.peek(Token::RParen) {
            loop {
                let target = self.temp;
                self.parse_exprto(target, true, arena)?;
                self.bump_temp()?;
                nargs += 1;
                if !self.accept(Token::Comma)? {
                    break;
                }
            }
        }
        self.expect(Token::RParen)?;
        Ok(nargs)
    }

    /// Parses a function literal; `func` has been consumed. Compiles the
    /// body into a fresh child prototype and emits `closure`.
    fn parse_closure<'b>(
        &mut self,
        arena: &'b Bump,
        name: Option<&str>,
    ) -> Result<Expr<'b>, CompileError> {
        let saved_locals = self.locals.len();
        let saved_ids = self.scope_ids.len();
        let saved_base = self.locals_base;
        let saved_temp = self.temp;

        self.locals_base = self.locals.len();
        self.temp = 0;
        self.protos.push(new_proto(name.unwrap_or("anonymous")));

        let mut nargs = 0;
        if self.accept(Token::LParen)? {
            if !self.peek(Token::RParen) {
                loop {
                    self.check(Token::Identifier)?;
                    let id = self.push_scope_id();
                    self.advance()?;
                    self.push_local(id)?;
                    nargs += 1;
                    if !self.accept(Token::Comma)? {
                        break;
                    }
                }
            }
            self.expect(Token::RParen)?;
        }

        if self.accept(Token::FatArrow)? {
            let reg = self.temp;
            self.parse_exprto(reg, true, arena)?;
            self.emit(Instr::abx(Opcode::Ret, reg, 1));
        } else {
            self.parse_block(arena)?;
        }
        // Every path returns.
        self.emit(Instr::abx(Opcode::Ret, 0, 0));

        let mut child = self.protos.pop().expect("prototype stack is never empty");
        child.nargs = nargs;
        child.nlocals = child.nlocals.max(nargs);
        let child_ptr = Box::into_raw(Box::new(child));

        self.locals.truncate(saved_locals);
        self.scope_ids.truncate(saved_ids);
        self.locals_base = saved_base;
        self.temp = saved_temp;

        let parent = self.proto();
        parent.protos.push(child_ptr);
        let proto_index = parent.protos.len() as i32 - 1;

        self.emit(Instr::abx(Opcode::Closure, self.temp, proto_index));
        Ok(Expr::loc(self.temp))
    }

    /// Parses a primary expression (literal, unary, subexpression, table,
    /// closure, identifier) followed by its accessor/call suffixes.
    fn parse_primary<'b>(
        &mut self,
        es: &mut ExprState,
        arena: &'b Bump,
    ) -> Result<Expr<'b>, CompileError> {
        let sloc = self.lex.loc.clone();
        let mut expr;

        match self.lex.tok {
            Token::KwNil => {
                self.advance()?;
                expr = Expr::nil();
            }
            Token::KwTrue => {
                self.advance()?;
                expr = Expr::boolean(true);
            }
            Token::KwFalse => {
                self.advance()?;
                expr = Expr::boolean(false);
            }
            Token::Number => {
                let n = self.lex.toknum;
                self.advance()?;
                expr = Expr::num(n);
            }
            Token::Str => {
                let bytes = arena.alloc_slice_copy(&self.lex.tokstr);
                self.advance()?;
                expr = Expr::str(bytes);
            }
            Token::LParen => {
                expr = self.parse_subexpr(es, arena)?;
            }
            Token::Bang => {
                self.advance()?;
                es.negated = !es.negated;
                let inner = self.parse_primary(es, arena)?;
                es.negated = !es.negated;
                expr = self.expr_negate(inner);
            }
            Token::Minus => {
                self.advance()?;
                let inner = self.parse_primary(es, arena)?;
                expr = self.expr_compile_unm(&sloc, inner)?;
            }
            Token::KwGlobals => {
                self.advance()?;
                expr = Expr { kind: ExprKind::Globals, positive: true };
            }
            Token::KwThis => {
                self.advance()?;
                self.emit(Instr::abx(Opcode::This, self.temp, 0));
                expr = Expr::loc(self.temp);
            }
            Token::KwFunc => {
                self.advance()?;
                expr = self.parse_closure(arena, None)?;
            }
            Token::LBrace => {
                expr = self.parse_table(arena)?;
            }
            Token::Identifier => {
                let id: &[u8] = arena.alloc_slice_copy(&self.lex.tokstr);
                self.advance()?;
                if let Some(l) = self.fetch_local(id) {
                    expr = Expr::loc(l);
                } else if self.peek(Token::LParen) {
                    expr = self.parse_static_call(&sloc, id, arena)?;
                } else {
                    let name = String::from_utf8_lossy(id).into_owned();
                    return Err(
                        self.error_at(&sloc, format!("unknown identifier '{name}'."))
                    );
                }
            }
            _ => return Err(self.error_syntax_at(&sloc)),
        }

        // Accessor and call suffixes.
        let mut dot_accessor = false;
        loop {
            match self.lex.tok {
                Token::LParen => {
                    expr = self.parse_call_suffix(&sloc, expr, dot_accessor, arena)?;
                }
                Token::Dot => {
                    self.advance()?;
                    self.check(Token::Identifier)?;
                    if matches!(expr.kind, ExprKind::Globals) {
                        let index = {
                            let bytes = self.lex.tokstr.clone();
                            self.const_fetch_str(&bytes)?
                        };
                        self.advance()?;
                        expr = Expr {
                            kind: ExprKind::GlobalAccess { key: -index - 1 },
                            positive: true,
                        };
                        dot_accessor = false;
                        continue;
                    }
                    let obj = self.expr_compile(expr, self.temp)?;
                    let obj_e = Expr::loc(obj);
                    let old_temp = self.use_temp(&obj_e)?;
                    let key_e = self.scan_id_expr(arena)?;
                    let key = self.expr_compile(key_e, self.temp)?;
                    self.temp = old_temp;
                    expr = Expr {
                        kind: ExprKind::Access { obj, key },
                        positive: true,
                    };
                    dot_accessor = true;
                    continue;
                }
                Token::LBracket => {
                    self.advance()?;
                    if matches!(expr.kind, ExprKind::Globals) {
                        return Err(self.error_at(
                            &sloc,
                            "global access requires an identifier key.",
                        ));
                    }
                    let obj = self.expr_compile(expr, self.temp)?;
                    let obj_e = Expr::loc(obj);
                    let old_temp = self.use_temp(&obj_e)?;
                    let key_e = self.parse_exprto(self.temp, false, arena)?;
                    let key = self.loc_of(&key_e);
                    self.expect(Token::RBracket)?;
                    self.temp = old_temp;
                    expr = Expr {
                        kind: ExprKind::Access { obj, key },
                        positive: true,
                    };
                }
                _ => break,
            }
            dot_accessor = false;
        }

        // An accessor that is not about to be assigned is read now, so its
        // operand registers cannot be clobbered by a later right-hand side.
        if matches!(expr.kind, ExprKind::Access { .. } | ExprKind::GlobalAccess { .. })
            && !matches!(
                self.lex.tok,
                Token::Assign
                    | Token::PlusEq
                    | Token::MinusEq
                    | Token::StarEq
                    | Token::SlashEq
            )
        {
            let positive = expr.positive;
            let l = self.expr_compile(Expr { kind: expr.kind, positive }, self.temp)?;
            expr = Expr::loc(l);
        }

        Ok(expr)
    }

    /// Compiles the dot-expression special case of `globals`: handled in
    /// `parse_primary`; here the suffix `(...)` forms for everything else.
    fn parse_call_suffix<'b>(
        &mut self,
        sloc: &SourceLoc,
        expr: Expr<'b>,
        dot_accessor: bool,
        arena: &'b Bump,
    ) -> Result<Expr<'b>, CompileError> {
        let mut args_location = self.temp;
        let opcode;
        let closure_or_key;
        let mut callee_in_temp = false;

        match expr.kind {
            ExprKind::Access { obj, key } if dot_accessor => {
                // Method call: receiver goes right below the arguments.
                if obj != args_location {
                    self.emit(Instr::abx(Opcode::Mov, args_location, obj));
                }
                opcode = Opcode::Mcall;
                closure_or_key = key;
                self.bump_temp()?;
                args_location = self.temp;
            }
            ExprKind::Access { obj, key } => {
                self.emit(Instr::abc(Opcode::Get, args_location, obj, key));
                opcode = Opcode::Call;
                closure_or_key = args_location;
                callee_in_temp = true;
                self.bump_temp()?;
                args_location = self.temp;
            }
            ExprKind::GlobalAccess { key } => {
                self.emit(Instr::abx(Opcode::GetGlob, args_location, key));
                opcode = Opcode::Call;
                closure_or_key = args_location;
                callee_in_temp = true;
                self.bump_temp()?;
                args_location = self.temp;
            }
            ExprKind::Loc(l) => {
                opcode = Opcode::Call;
                closure_or_key = l;
                if l == self.temp {
                    // The callee occupies the free temporary: keep the
                    // arguments above it.
                    callee_in_temp = true;
                    self.bump_temp()?;
                    args_location = self.temp;
                }
            }
            _ => {
                let message =
                    format!("cannot call a value of type {}.", expr.type_name());
                return Err(self.error_at(sloc, message));
            }
        }

        let nargs = self.parse_call_args(arena)?;

        // A zero-argument call through a temporary needs no argument window
        // above the callee: reuse the callee register as the frame base.
        if nargs == 0 && callee_in_temp {
            args_location = closure_or_key;
        }

        self.emit(Instr::abc(opcode, args_location, closure_or_key, nargs));
        self.temp = args_location;
        Ok(Expr::loc(args_location))
    }

    /// A call of an identifier that is not a local: a host static function,
    /// bound at compile time.
    fn parse_static_call<'b>(
        &mut self,
        sloc: &SourceLoc,
        id: &[u8],
        arena: &'b Bump,
    ) -> Result<Expr<'b>, CompileError> {
        let name = String::from_utf8_lossy(id).into_owned();
        let first_arg_reg = self.temp;
        let nargs = self.parse_call_args(arena)?;
        let sig = match self.statics.lookup(&name) {
            Some(sig) => sig,
            None => return Err(self.error_at(sloc, format!("unknown identifier '{name}'."))),
        };
        if nargs < sig.min_args || nargs > sig.max_args {
            let message = format!(
                "static function '{}' does not accept {} {}.",
                name,
                nargs,
                if nargs == 1 { "argument" } else { "arguments" }
            );
            return Err(self.error_at(sloc, message));
        }
        let index_loc = {
            let index = self.const_fetch_num(sig.index as f64)?;
            self.make_const(index, self.temp)?
        };
        self.emit(Instr::abc(Opcode::Scall, first_arg_reg, index_loc, nargs));
        self.temp = first_arg_reg;
        Ok(Expr::loc(first_arg_reg))
    }

    /// Parses the right-hand chain of a binary expression with precedence
    /// climbing.
    fn parse_binary_rhs<'b>(
        &mut self,
        es: &mut ExprState,
        mut lhs: Expr<'b>,
        precedence: i32,
        arena: &'b Bump,
    ) -> Result<Expr<'b>, CompileError> {
        loop {
            let binop = match Binop::from_token(self.lex.tok) {
                Some(op) => op,
                None => return Ok(lhs),
            };
            let tok_precedence = binop.precedence();
            if tok_precedence < precedence {
                return Ok(lhs);
            }
            let sloc = self.lex.loc.clone();

            self.compile_logical_op(es, binop, lhs)?;

            self.advance()?; // eat the operator

            let old_temp = self.use_temp(&lhs)?;
            let mut rhs_es = *es;
            let mut rhs = self.parse_primary(&mut rhs_es, arena)?;

            let next_precedence = Binop::from_token(self.lex.tok)
                .map(Binop::precedence)
                .unwrap_or(-1);
            if next_precedence > tok_precedence {
                // Higher-precedence operator ahead: it owns our rhs.
                rhs_es.negated = es.negated;
                rhs_es.true_branch_idx = self.label_true.len();
                rhs_es.false_branch_idx = self.label_false.len();
                rhs = self.parse_binary_rhs(&mut rhs_es, rhs, tok_precedence + 1, arena)?;
            }

            self.temp = old_temp;
            lhs = self.expr_compile_binary(&sloc, binop, lhs, rhs, arena)?;
        }
    }

    /// Parses an expression, including assignment forms when the first
    /// primary turns out to be an lvalue.
    fn parse_expr<'b>(
        &mut self,
        es: &mut ExprState,
        arena: &'b Bump,
    ) -> Result<Expr<'b>, CompileError> {
        let mut my_es = *es;
        let sloc = self.lex.loc.clone();
        let lhs = self.parse_primary(&mut my_es, arena)?;

        let assign_op = match self.lex.tok {
            Token::Assign => Some(None),
            Token::PlusEq => Some(Some(Binop::Add)),
            Token::MinusEq => Some(Some(Binop::Sub)),
            Token::StarEq => Some(Some(Binop::Mul)),
            Token::SlashEq => Some(Some(Binop::Div)),
            _ => None,
        };

        if let Some(compound) = assign_op {
            self.advance()?;
            if !lhs.positive {
                return Err(self.error_lhs(&sloc));
            }
            return self.parse_assignment(&sloc, lhs, compound, arena);
        }

        self.parse_binary_rhs(&mut my_es, lhs, 0, arena)
    }

    fn error_lhs(&mut self, sloc: &SourceLoc) -> CompileError {
        self.error_at(sloc, "lhs of assignment is not an assignable expression.")
    }

    fn parse_assignment<'b>(
        &mut self,
        sloc: &SourceLoc,
        lhs: Expr<'b>,
        compound: Option<Binop>,
        arena: &'b Bump,
    ) -> Result<Expr<'b>, CompileError> {
        match lhs.kind {
            ExprKind::Loc(l) => {
                // Assignable locations are exactly the current locals.
                if l < 0 || l >= self.nlocal_regs() {
                    return Err(self.error_lhs(sloc));
                }
                match compound {
                    None => {
                        self.parse_exprto(l, true, arena)?;
                    }
                    Some(op) => {
                        let rhs = self.parse_exprto(self.temp, false, arena)?;
                        let rhs_loc = self.loc_of(&rhs);
                        self.emit(Instr::abc(op.arith_opcode(), l, l, rhs_loc));
                    }
                }
                Ok(Expr::loc(l))
            }
            ExprKind::Access { obj, key } => {
                // Keep the accessor's registers out of the rhs's way.
                let saved_temp = self.temp;
                if obj >= 0 {
                    self.temp = self.temp.max(obj + 1);
                }
                if key >= 0 {
                    self.temp = self.temp.max(key + 1);
                }
                let result = match compound {
                    None => {
                        let rhs = self.parse_exprto(self.temp, false, arena)?;
                        let rhs_loc = self.loc_of(&rhs);
                        self.emit(Instr::abc(Opcode::Set, obj, key, rhs_loc));
                        rhs_loc
                    }
                    Some(op) => {
                        let dst = self.temp;
                        self.emit(Instr::abc(Opcode::Get, dst, obj, key));
                        self.bump_temp()?;
                        let rhs = self.parse_exprto(self.temp, false, arena)?;
                        let rhs_loc = self.loc_of(&rhs);
                        self.emit(Instr::abc(op.arith_opcode(), dst, dst, rhs_loc));
                        self.emit(Instr::abc(Opcode::Set, obj, key, dst));
                        dst
                    }
                };
                self.temp = saved_temp;
                Ok(Expr::loc(result))
            }
            ExprKind::GlobalAccess { key } => {
                let saved_temp = self.temp;
                let result = match compound {
                    None => {
                        let rhs = self.parse_exprto(self.temp, true, arena)?;
                        let rhs_loc = self.loc_of(&rhs);
                        self.emit(Instr::abx(Opcode::SetGlob, rhs_loc, key));
                        rhs_loc
                    }
                    Some(op) => {
                        let dst = self.temp;
                        self.emit(Instr::abx(Opcode::GetGlob, dst, key));
                        self.bump_temp()?;
                        let rhs = self.parse_exprto(self.temp, false, arena)?;
                        let rhs_loc = self.loc_of(&rhs);
                        self.emit(Instr::abc(op.arith_opcode(), dst, dst, rhs_loc));
                        self.emit(Instr::abx(Opcode::SetGlob, dst, key));
                        dst
                    }
                };
                self.temp = saved_temp;
                Ok(Expr::loc(result))
            }
            _ => Err(self.error_lhs(sloc)),
        }
    }

    // ------------------------------------------------------------------
    // statements
    // ------------------------------------------------------------------

    /// Parses a condition for branching only: no boolean ever reaches a
    /// register. If the expression equals `test_value` control jumps to the
    /// true label, otherwise it falls through.
    fn parse_cond(&mut self, test_value: bool, arena: &Bump) -> Result<(), CompileError> {
        let mut es = self.make_expr_state(!test_value);
        let expr = self.parse_expr(&mut es, arena)?;

        if let ExprKind::Compare { op, lhs, rhs } = expr.kind {
            let result = expr.positive ^ !test_value;
            self.emit(Instr::abc(op.opcode(), lhs, rhs, result as i32));
        } else {
            let mut l = self.expr_compile(expr, self.temp)?;
            if l < 0 {
                self.emit(Instr::abx(Opcode::Mov, self.temp, l));
                l = self.temp;
            }
            self.emit(Instr::abx(Opcode::Test, l, test_value as i32));
        }

        let jump_idx = self.ninstrs();
        self.label_true.push(jump_idx);
        self.emit(Instr::jump(0));
        Ok(())
    }

    fn parse_vardecl(&mut self, arena: &Bump) -> Result<(), CompileError> {
        self.expect(Token::KwVar)?;
        loop {
            self.check(Token::Identifier)?;
            let id = self.push_scope_id();
            self.advance()?;

            if self.accept(Token::Assign)? {
                self.parse_exprto(self.temp, true, arena)?;
            } else {
                self.emit(Instr::abx(Opcode::LoadNil, self.temp, self.temp));
            }
            self.push_local(id)?;

            if !self.accept(Token::Comma)? {
                break;
            }
        }
        Ok(())
    }

    fn parse_if(&mut self, arena: &Bump) -> Result<(), CompileError> {
        self.expect(Token::KwIf)?;
        let true_begin = self.label_true.len();
        let false_begin = self.label_false.len();

        // Branch to "true" when the condition is false.
        self.expect(Token::LParen)?;
        self.parse_cond(false, arena)?;
        self.expect(Token::RParen)?;

        self.label_bind_here(Branch::False, false_begin);
        self.parse_block_or_stmt(arena)?;

        if self.accept(Token::KwElse)? {
            let exit_jump_idx = self.ninstrs();
            self.emit(Instr::jump(0));

            // The labels are swapped because the condition compiled to
            // false: the else branch lives in the true label.
            self.label_bind_here(Branch::True, true_begin);

            if self.peek(Token::KwIf) {
                self.parse_if(arena)?;
            } else {
                self.parse_block_or_stmt(arena)?;
            }

            let offset = self.offset_to_next(exit_jump_idx);
            self.proto().instrs[exit_jump_idx].set_jump_offset(offset);
        } else {
            self.label_bind_here(Branch::True, true_begin);
        }
        Ok(())
    }

    fn parse_while(&mut self, arena: &Bump) -> Result<(), CompileError> {
        self.expect(Token::KwWhile)?;
        let true_begin = self.label_true.len();
        let false_begin = self.label_false.len();
        let first_cond_idx = self.ninstrs();

        self.expect(Token::LParen)?;
        self.parse_cond(false, arena)?;
        self.expect(Token::RParen)?;

        self.label_bind_here(Branch::False, false_begin);
        self.parse_block_or_stmt(arena)?;

        // Back to the condition.
        let offset = first_cond_idx as i32 - self.ninstrs() as i32 - 1;
        self.emit(Instr::jump(offset));

        self.label_bind_here(Branch::True, true_begin);
        Ok(())
    }

    fn parse_do_while(&mut self, arena: &Bump) -> Result<(), CompileError> {
        self.expect(Token::KwDo)?;
        let true_begin = self.label_true.len();
        let false_begin = self.label_false.len();
        let first_body_idx = self.ninstrs();

        self.parse_block_or_stmt(arena)?;
        self.label_bind_here(Branch::True, true_begin);

        self.expect(Token::KwWhile)?;
        self.expect(Token::LParen)?;
        self.parse_cond(true, arena)?;
        self.expect(Token::RParen)?;

        self.label_bind(Branch::True, true_begin, first_body_idx);
        self.label_bind_here(Branch::False, false_begin);
        Ok(())
    }

    /// `for (var <id> in <expr>) block`: the syntax is accepted and the
    /// iterable evaluated, but no iteration protocol exists yet, so the
    /// compiled body is statically skipped.
    fn parse_for(&mut self, arena: &Bump) -> Result<(), CompileError> {
        self.expect(Token::KwFor)?;
        self.expect(Token::LParen)?;
        self.expect(Token::KwVar)?;
        self.check(Token::Identifier)?;

        let saved_locals = self.locals.len();
        let saved_ids = self.scope_ids.len();
        let saved_temp = self.temp;

        let id = self.push_scope_id();
        self.advance()?;
        self.emit(Instr::abx(Opcode::LoadNil, self.temp, self.temp));
        self.push_local(id)?;

        self.expect(Token::KwIn)?;
        self.parse_exprto(self.temp, false, arena)?;
        self.expect(Token::RParen)?;

        let skip_jump_idx = self.ninstrs();
        self.emit(Instr::jump(0));
        self.parse_block_or_stmt(arena)?;
        let offset = self.offset_to_next(skip_jump_idx);
        self.proto().instrs[skip_jump_idx].set_jump_offset(offset);

        self.locals.truncate(saved_locals);
        self.scope_ids.truncate(saved_ids);
        self.temp = saved_temp;
        Ok(())
    }

    fn parse_return(&mut self, arena: &Bump) -> Result<(), CompileError> {
        self.expect(Token::KwReturn)?;
        let first = self.temp;
        if self.accept_end_of_stmt()? {
            self.emit(Instr::abx(Opcode::Ret, 0, 0));
            return Ok(());
        }
        let mut count = 0;
        loop {
            let target = self.temp;
            self.parse_exprto(target, true, arena)?;
            self.bump_temp()?;
            count += 1;
            if !self.accept(Token::Comma)? {
                break;
            }
        }
        self.emit(Instr::abx(Opcode::Ret, first, count));
        self.temp = first;
        self.expect_end_of_stmt()
    }

    fn parse_throw(&mut self, arena: &Bump) -> Result<(), CompileError> {
        self.expect(Token::KwThrow)?;
        let expr = self.parse_exprto(self.temp, false, arena)?;
        let l = self.loc_of(&expr);
        self.emit(Instr::abx(Opcode::Throw, 0, l));
        Ok(())
    }

    fn parse_debug(&mut self, arena: &Bump) -> Result<(), CompileError> {
        self.expect(Token::KwDebug)?;
        self.expect(Token::LParen)?;
        let first = self.temp;
        if !self.peek(Token::RParen) {
            loop {
                let target = self.temp;
                self.parse_exprto(target, true, arena)?;
                self.bump_temp()?;
                if !self.accept(Token::Comma)? {
                    break;
                }
            }
        }
        self.expect(Token::RParen)?;
        self.emit(Instr::abx(Opcode::Debug, first, self.temp - first));
        self.temp = first;
        self.accept(Token::Semicolon)?;
        Ok(())
    }

    /// `func <id> (params) body` declares a local bound to the closure.
    fn parse_func_stmt(&mut self, arena: &Bump) -> Result<(), CompileError> {
        self.expect(Token::KwFunc)?;
        self.check(Token::Identifier)?;
        let id = self.push_scope_id();
        let name = String::from_utf8_lossy(&self.lex.tokstr).into_owned();
        self.advance()?;

        let closure = self.parse_closure(arena, Some(&name))?;
        let closure_loc = self.loc_of(&closure);
        debug_assert_eq!(closure_loc, self.temp);
        self.push_local(id)
    }

    fn parse_stmt(&mut self, arena: &Bump) -> Result<(), CompileError> {
        // No temporaries are live between statements: the next free
        // register is the one above the declared locals.
        self.temp = self.nlocal_regs();
        match self.lex.tok {
            Token::KwVar => {
                self.parse_vardecl(arena)?;
                self.expect_end_of_stmt()
            }
            Token::KwIf => self.parse_if(arena),
            Token::KwWhile => self.parse_while(arena),
            Token::KwDo => self.parse_do_while(arena),
            Token::KwFor => self.parse_for(arena),
            Token::KwFunc => self.parse_func_stmt(arena),
            Token::KwReturn => self.parse_return(arena),
            Token::KwThrow => {
                self.parse_throw(arena)?;
                self.expect_end_of_stmt()
            }
            Token::KwDebug => self.parse_debug(arena),
            Token::LBrace => {
                self.advance()?;
                let saved_locals = self.locals.len();
                let saved_ids = self.scope_ids.len();
                let saved_temp = self.temp;
                self.parse_stmts(arena)?;
                self.expect(Token::RBrace)?;
                self.locals.truncate(saved_locals);
                self.scope_ids.truncate(saved_ids);
                self.temp = saved_temp;
                Ok(())
            }
            _ => {
                // Expression statement; branches are fully resolved here.
                self.parse_exprto(self.temp, false, arena)?;
                self.expect_end_of_stmt()
            }
        }
    }

    fn parse_stmts(&mut self, arena: &Bump) -> Result<(), CompileError> {
        while !self.peek(Token::RBrace) && !self.peek(Token::Eos) {
            self.parse_stmt(arena)?;
        }
        Ok(())
    }

    fn parse_block(&mut self, arena: &Bump) -> Result<(), CompileError> {
        self.expect(Token::LBrace)?;
        let saved_locals = self.locals.len();
        let saved_ids = self.scope_ids.len();
        let saved_temp = self.temp;
        self.parse_stmts(arena)?;
        self.expect(Token::RBrace)?;
        self.locals.truncate(saved_locals);
        self.scope_ids.truncate(saved_ids);
        self.temp = saved_temp;
        Ok(())
    }

    /// A brace block, or a single statement (so `if (c) debug(x)` works).
    fn parse_block_or_stmt(&mut self, arena: &Bump) -> Result<(), CompileError> {
        if self.peek(Token::LBrace) {
            self.parse_block(arena)
        } else {
            let saved_locals = self.locals.len();
            let saved_ids = self.scope_ids.len();
            let saved_temp = self.temp;
            self.parse_stmt(arena)?;
            self.locals.truncate(saved_locals);
            self.scope_ids.truncate(saved_ids);
            self.temp = saved_temp;
            Ok(())
        }
    }

    /// The whole module: top-level statements followed by an implicit
    /// return. The scratch arena recycles at each top-level statement.
    fn parse_module(&mut self) -> Result<(), CompileError> {
        let mut arena = Bump::new();
        while !self.peek(Token::Eos) {
            self.parse_stmt(&arena)?;
            arena.reset();
        }
        self.emit(Instr::abx(Opcode::Ret, 0, 0));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StrSource;
    use koji_core::class::{class_class_new, Class};
    use koji_core::object::object_unref;

    struct Fixture {
        heap: Heap,
        class_class: *mut Class,
        cls_string: *mut Class,
    }

    impl Fixture {
        fn new() -> Fixture {
            let heap = Heap::new();
            let class_class = class_class_new(&heap);
            let cls_string = koji_core::string::string_class_new(&heap, class_class);
            Fixture { heap, class_class, cls_string }
        }

        fn compile(&self, source: &str) -> Result<*mut Prototype, CompileError> {
            let mut reporter = |_: &SourceLoc, _: &str| {};
            compile(CompileInfo {
                source_name: "<test>",
                reader: Box::new(StrSource::new(source)),
                reporter: &mut reporter,
                heap: self.heap.clone(),
                cls_string: self.cls_string,
                statics: &NoStaticFns,
            })
        }

        fn release(&self, proto: *mut Prototype) {
            unsafe { prototype_release(proto, &self.heap) };
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            unsafe {
                object_unref(&self.heap, self.cls_string.cast());
                object_unref(&self.heap, self.class_class.cast());
            }
            assert_eq!(self.heap.live_allocations(), 0, "leaked allocations");
        }
    }

    fn ops(proto: *mut Prototype) -> Vec<Opcode> {
        unsafe { (*proto).instrs.iter().map(|i| i.op()).collect() }
    }

    #[test]
    fn arithmetic_folds_to_one_constant() {
        let fx = Fixture::new();
        let proto = fx.compile("var a = 1 + 2 * 3").unwrap();
        unsafe {
            assert_eq!((*proto).consts.len(), 1);
            assert_eq!((&(*proto).consts)[0].as_number(), 7.0);
            assert_eq!(ops(proto), vec![Opcode::Mov, Opcode::Ret]);
        }
        fx.release(proto);
    }

    #[test]
    fn string_concatenation_folds() {
        let fx = Fixture::new();
        let proto = fx.compile("var s = \"foo\" + \"bar\"").unwrap();
        unsafe {
            assert_eq!((*proto).consts.len(), 1);
            let c = (&(*proto).consts)[0];
            assert_eq!(Str::bytes(c.as_object().cast()), b"foobar");
        }
        fx.release(proto);
    }

    #[test]
    fn string_repetition_folds() {
        let fx = Fixture::new();
        let proto = fx.compile("var s = \"ab\" * 3").unwrap();
        unsafe {
            let c = (&(*proto).consts)[0];
            assert_eq!(Str::bytes(c.as_object().cast()), b"ababab");
        }
        fx.release(proto);
    }

    #[test]
    fn constants_are_interned() {
        let fx = Fixture::new();
        let proto = fx
            .compile("var a = 1\nvar b = 1\nvar s = \"x\"\nvar t = \"x\"")
            .unwrap();
        unsafe {
            assert_eq!((*proto).consts.len(), 2);
        }
        fx.release(proto);
    }

    #[test]
    fn register_high_water_matches_max_target() {
        let fx = Fixture::new();
        let proto = fx.compile("var a = 1\nvar b = 2\nvar c = a + b").unwrap();
        unsafe {
            let max_a = (*proto)
                .instrs
                .iter()
                .filter(|i| i.op().has_target())
                .map(|i| i.a())
                .max()
                .unwrap();
            assert_eq!((*proto).nlocals, max_a + 1);
        }
        fx.release(proto);
    }

    #[test]
    fn short_circuit_uses_testset() {
        let fx = Fixture::new();
        let proto = fx.compile("var a = true\nvar b = a && a").unwrap();
        assert!(ops(proto).contains(&Opcode::TestSet));
        fx.release(proto);
    }

    #[test]
    fn comparison_in_condition_stays_a_branch() {
        let fx = Fixture::new();
        let proto = fx
            .compile("var a = 1\nvar b = 2\nif (a < b) debug(a)")
            .unwrap();
        let ops = ops(proto);
        assert!(ops.contains(&Opcode::Lt));
        // Branch-only use: no loadbool pair materializes the comparison.
        assert!(!ops.contains(&Opcode::LoadBool));
        fx.release(proto);
    }

    #[test]
    fn globals_compile_to_getglob_setglob() {
        let fx = Fixture::new();
        let proto = fx.compile("globals.x = 1\nvar y = globals.x").unwrap();
        let ops = ops(proto);
        assert!(ops.contains(&Opcode::SetGlob));
        assert!(ops.contains(&Opcode::GetGlob));
        fx.release(proto);
    }

    #[test]
    fn function_statement_declares_a_local() {
        let fx = Fixture::new();
        let proto = fx
            .compile("func add(a, b) { return a + b }\nvar r = add(2, 40)")
            .unwrap();
        unsafe {
            assert_eq!((*proto).protos.len(), 1);
            let child = (&(*proto).protos)[0];
            assert_eq!((*child).nargs, 2);
            assert!((*child).instrs.iter().any(|i| i.op() == Opcode::Ret));
        }
        assert!(ops(proto).contains(&Opcode::Call));
        fx.release(proto);
    }

    #[test]
    fn table_literals_emit_newtable_and_set() {
        let fx = Fixture::new();
        let proto = fx.compile("var t = { x: 1, y: 2, 3 }").unwrap();
        let ops = ops(proto);
        assert!(ops.contains(&Opcode::NewTable));
        assert_eq!(ops.iter().filter(|&&o| o == Opcode::Set).count(), 3);
        fx.release(proto);
    }

    #[test]
    fn nil_arithmetic_is_rejected() {
        let fx = Fixture::new();
        assert!(fx.compile("var a = nil + 1").is_err());
        assert!(fx.compile("var a = true * 2").is_err());
    }

    #[test]
    fn unknown_identifier_is_rejected() {
        let fx = Fixture::new();
        assert!(fx.compile("var a = missing").is_err());
    }

    #[test]
    fn constants_are_not_assignable() {
        let fx = Fixture::new();
        assert!(fx.compile("1 = 2").is_err());
    }

    #[test]
    fn bare_globals_is_rejected() {
        let fx = Fixture::new();
        assert!(fx.compile("var g = globals").is_err());
    }

    #[test]
    fn comparisons_fold_with_nil_as_minimum() {
        let fx = Fixture::new();
        let proto = fx.compile("var a = 1 == 1\nvar b = nil < 1").unwrap();
        unsafe {
            // Both fold to booleans: only loadbool instructions, no compares.
            assert!(!(*proto).instrs.iter().any(|i| i.op() == Opcode::Eq));
            assert!(!(*proto).instrs.iter().any(|i| i.op() == Opcode::Lt));
        }
        fx.release(proto);
    }

    #[test]
    fn error_frees_partial_prototypes() {
        let fx = Fixture::new();
        // String constants are allocated before the error strikes.
        assert!(fx.compile("var s = \"kept\"\nvar t = \"oops\" +").is_err());
        assert_eq!(fx.heap.live_allocations(), 0);
    }

    #[test]
    fn compound_assignment_desugars() {
        let fx = Fixture::new();
        let proto = fx.compile("var a = 1\na += 2").unwrap();
        assert!(ops(proto).contains(&Opcode::Add));
        fx.release(proto);
    }

    #[test]
    fn while_loop_jumps_back() {
        let fx = Fixture::new();
        let proto = fx
            .compile("var i = 0\nwhile (i < 3) { i = i + 1 }")
            .unwrap();
        unsafe {
            assert!((*proto)
                .instrs
                .iter()
                .any(|i| i.op() == Opcode::Jump && i.jump_offset() < 0));
        }
        fx.release(proto);
    }
}
