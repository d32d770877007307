//! Parser for the textual IR format.
//!
//! The grammar is LL(1).  A program is a sequence of items: globals,
//! extern declarations, and functions.  Globals and externs must precede
//! the functions that reference them.
//!
//! ```text
//! program  := item*
//! item     := global | extern | function
//! global   := AT_ID ":" type
//! extern   := "extern" AT_ID ":" type attrs?
//! function := "fn" ID "(" params? ")" "->" rettype attrs? "{" lets? block+ "}"
//! lets     := "let" LOCAL ":" type ("," LOCAL ":" type)*
//! block    := ID ":" inst* term
//! ```

use derive_more::Display;
use logos::Logos;

use super::*;

// SECTION: interface

pub fn parse(code: &str) -> Result<Program, ParseError> {
    let mut parser = Parser::new(code)?;
    program_r(&mut parser)
}

/// A parse error with explanatory message.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub struct ParseError(pub String);
impl std::error::Error for ParseError {}

// SECTION: lexer

#[derive(Logos, Copy, Clone, Debug, PartialEq, Eq)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip r"//[^\n]*")]
pub enum TokenKind {
    #[token("fn")]
    Fn,
    #[token("extern")]
    Extern,
    #[token("let")]
    Let,
    #[token("int")]
    Int,
    #[token("float")]
    Float,
    #[token("token")]
    TokenTy,
    #[token("gc")]
    Gc,
    #[token("to")]
    To,
    #[token("null")]
    Null,
    #[token("undef")]
    Undef,
    #[token("cold")]
    Cold,
    #[token("&")]
    Address,
    #[token("->")]
    Arrow,
    #[token("(")]
    OpenParen,
    #[token(")")]
    CloseParen,
    #[token("[")]
    OpenBracket,
    #[token("]")]
    CloseBracket,
    #[token("{")]
    OpenBrace,
    #[token("}")]
    CloseBrace,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token("=")]
    Assign,
    #[token("_")]
    Underscore,
    #[regex(r"\$[a-z0-9_.]+")]
    Op,
    #[regex(r"%[A-Za-z_][A-Za-z0-9_.]*")]
    Local,
    #[regex(r"@[A-Za-z_][A-Za-z0-9_.]*")]
    AtId,
    #[regex(r"-?[0-9]+")]
    Num,
    #[regex(r"[A-Za-z][A-Za-z0-9_.-]*")]
    Id,
}

#[derive(Clone, Debug)]
struct Token {
    kind: TokenKind,
    span: std::ops::Range<usize>,
}

fn lex(code: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = vec![];
    for (res, span) in TokenKind::lexer(code).spanned() {
        match res {
            Ok(kind) => tokens.push(Token { kind, span }),
            Err(()) => {
                return Err(ParseError(format!(
                    "lex error at byte {}: unexpected character {:?}",
                    span.start,
                    &code[span.clone()]
                )))
            }
        }
    }
    Ok(tokens)
}

// SECTION: parser functionality

#[derive(Clone, Debug)]
struct Parser<'a> {
    code: &'a str,      // the source code being parsed
    tokens: Vec<Token>, // the token stream
    pos: usize,         // the position in the token stream
    // global variables seen so far, for resolving `@x` operands
    globals: Map<String, GlobalId>,
    // types of the current function's params and let-declared values
    symtab: Map<String, Type>,
}

impl<'a> Parser<'a> {
    fn new(code: &'a str) -> Result<Self, ParseError> {
        let tokens = lex(code)?;
        if tokens.is_empty() {
            Err(ParseError("empty token stream".to_string()))
        } else {
            Ok(Parser {
                code,
                tokens,
                pos: 0,
                globals: Map::new(),
                symtab: Map::new(),
            })
        }
    }

    // if the next token has the given kind advances the iterator and returns true,
    // otherwise returns false.
    fn eat(&mut self, kind: TokenKind) -> bool {
        match self.peek() {
            Some(k) if k == kind => {
                self.next();
                true
            }
            _ => false,
        }
    }

    // returns an Ok or Err result depending on whether the next token has the given
    // kind, advancing the iterator on an Ok result.
    fn expect(&mut self, kind: TokenKind) -> Result<(), ParseError> {
        if self.eat(kind) {
            Ok(())
        } else {
            self.error_next(&format!("expected `{kind:?}`"))
        }
    }

    fn next(&mut self) -> Option<TokenKind> {
        if !self.end() {
            self.pos += 1;
            Some(self.tokens[self.pos - 1].kind)
        } else {
            None
        }
    }

    fn peek(&self) -> Option<TokenKind> {
        if !self.end() {
            Some(self.tokens[self.pos].kind)
        } else {
            None
        }
    }

    fn next_is(&self, kind: TokenKind) -> bool {
        self.peek() == Some(kind)
    }

    fn end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    // returns the lexeme of the token immediately prior to the current token.
    fn slice_prev(&self) -> &str {
        &self.code[self.tokens[self.pos - 1].span.clone()]
    }

    // returns a parse error knowing that the next token to be inspected causes an
    // error (based on a call to peek(), next_is(), etc).
    fn error_next<T>(&self, msg: &str) -> Result<T, ParseError> {
        if self.pos >= self.tokens.len() {
            Err(ParseError(format!(
                "parse error: unexpected end of input ({msg})\n"
            )))
        } else {
            self.error(self.pos, msg)
        }
    }

    // constructs a parse error given the position of the error-causing token in the
    // token stream.
    fn error<T>(&self, pos: usize, msg: &str) -> Result<T, ParseError> {
        let span = &self.tokens[pos].span;

        let (row, row_start) = {
            let mut row = 0;
            let mut row_start = 0;
            for (idx, _) in self.code.match_indices('\n') {
                if idx > span.start {
                    break;
                }
                row += 1;
                row_start = idx + 1;
            }
            (row, row_start)
        };

        let col = span.start - row_start;
        let line = self.code.lines().nth(row).unwrap_or("");

        Err(ParseError(format!(
            "parse error in line {row}, column {col}\n{line}\n{:width$}^\n{msg}\n",
            " ",
            width = col
        )))
    }

    // the declared type of a `%x` lexeme, which must come from the current
    // function's params or let declarations.
    fn lookup(&self, lexeme: &str) -> Result<ValueId, ParseError> {
        let name = &lexeme[1..];
        match self.symtab.get(name) {
            Some(ty) => Ok(val_id(name, ty.clone())),
            None => self.error(self.pos - 1, &format!("undeclared value `{lexeme}`")),
        }
    }
}

use TokenKind::*;

// SECTION: parsing functions

fn program_r(parser: &mut Parser) -> Result<Program, ParseError> {
    let mut program = Program::default();

    while !parser.end() {
        if parser.eat(Extern) {
            let (id, e) = extern_r(parser)?;
            program.externs.insert(id, e);
        } else if parser.next_is(Fn) {
            let f = function_r(parser)?;
            program.functions.insert(f.id.clone(), f);
        } else if parser.eat(AtId) {
            let name = parser.slice_prev()[1..].to_string();
            parser.expect(Colon)?;
            let ty = type_r(parser)?;
            let g = global_id(&name, ty);
            parser.globals.insert(name, g.clone());
            program.globals.insert(g);
        } else {
            return parser.error_next("expected a global, extern, or function");
        }
    }

    Ok(program)
}

fn extern_r(parser: &mut Parser) -> Result<(FuncId, super::Extern), ParseError> {
    parser.expect(AtId)?;
    let id = func_id(&parser.slice_prev()[1..]);
    parser.expect(Colon)?;
    let ty = type_r(parser)?;
    let attrs = attrs_r(parser)?;
    Ok((id, super::Extern { ty, attrs }))
}

fn attrs_r(parser: &mut Parser) -> Result<Set<String>, ParseError> {
    let mut attrs = Set::new();
    if parser.eat(OpenBracket) {
        loop {
            parser.expect(Id)?;
            attrs.insert(parser.slice_prev().to_string());
            if !parser.eat(Comma) {
                break;
            }
        }
        parser.expect(CloseBracket)?;
    }
    Ok(attrs)
}

// type.
fn type_r(parser: &mut Parser) -> Result<Type, ParseError> {
    if parser.eat(Address) {
        if parser.eat(Gc) {
            Ok(gc_ptr_ty(type_r(parser)?))
        } else {
            Ok(ptr_ty(type_r(parser)?))
        }
    } else if parser.eat(Int) {
        Ok(int_ty())
    } else if parser.eat(Float) {
        Ok(float_ty())
    } else if parser.eat(TokenTy) {
        Ok(token_ty())
    } else if parser.eat(OpenParen) {
        let mut params = vec![];
        if !parser.eat(CloseParen) {
            loop {
                params.push(type_r(parser)?);
                if !parser.eat(Comma) {
                    break;
                }
            }
            parser.expect(CloseParen)?;
        }
        parser.expect(Arrow)?;
        Ok(func_ty(ret_type_r(parser)?, params))
    } else {
        parser.error_next("expected a type")
    }
}

fn ret_type_r(parser: &mut Parser) -> Result<Option<Type>, ParseError> {
    if parser.eat(Underscore) {
        Ok(None)
    } else {
        Ok(Some(type_r(parser)?))
    }
}

fn function_r(parser: &mut Parser) -> Result<Function, ParseError> {
    parser.expect(Fn)?;
    parser.expect(Id)?;
    let id = func_id(parser.slice_prev());

    parser.symtab.clear();

    parser.expect(OpenParen)?;
    let mut params = vec![];
    if !parser.eat(CloseParen) {
        loop {
            parser.expect(Local)?;
            let name = parser.slice_prev()[1..].to_string();
            parser.expect(Colon)?;
            let ty = type_r(parser)?;
            parser.symtab.insert(name.clone(), ty.clone());
            params.push(val_id(&name, ty));
            if !parser.eat(Comma) {
                break;
            }
        }
        parser.expect(CloseParen)?;
    }

    parser.expect(Arrow)?;
    let ret_ty = ret_type_r(parser)?;
    let attrs = attrs_r(parser)?;
    parser.expect(OpenBrace)?;

    if parser.eat(Let) {
        loop {
            parser.expect(Local)?;
            let name = parser.slice_prev()[1..].to_string();
            parser.expect(Colon)?;
            let ty = type_r(parser)?;
            parser.symtab.insert(name, ty);
            if !parser.eat(Comma) {
                break;
            }
        }
    }

    let mut body = Map::new();
    while !parser.eat(CloseBrace) {
        let bb = block_r(parser)?;
        if body.insert(bb.id.clone(), bb.clone()).is_some() {
            return parser.error(parser.pos - 1, &format!("duplicate block label `{}`", bb.id));
        }
    }

    Ok(Function {
        id,
        params,
        ret_ty,
        attrs,
        body,
    })
}

fn block_r(parser: &mut Parser) -> Result<BasicBlock, ParseError> {
    parser.expect(Id)?;
    let id = bb_id(parser.slice_prev());
    parser.expect(Colon)?;

    let mut insts = vec![];
    loop {
        if parser.next_is(Op) {
            let op = op_lexeme(parser);
            match op.as_str() {
                "$jump" | "$branch" | "$ret" | "$unreachable" => {
                    let term = term_r(parser)?;
                    return Ok(BasicBlock { id, insts, term });
                }
                _ => insts.push(inst_r(parser, None)?),
            }
        } else if parser.next_is(Local) {
            parser.next();
            let lhs = parser.lookup(&parser.slice_prev().to_string())?;
            parser.expect(Assign)?;
            insts.push(inst_r(parser, Some(lhs))?);
        } else {
            return parser.error_next("expected an instruction or terminator");
        }
    }
}

// the lexeme of the upcoming Op token, without advancing.
fn op_lexeme(parser: &Parser) -> String {
    parser.code[parser.tokens[parser.pos].span.clone()].to_string()
}

fn term_r(parser: &mut Parser) -> Result<Terminal, ParseError> {
    parser.expect(Op)?;
    match parser.slice_prev() {
        "$jump" => {
            parser.expect(Id)?;
            Ok(Terminal::Jump(bb_id(parser.slice_prev())))
        }
        "$branch" => {
            let cond = operand_r(parser)?;
            parser.expect(Comma)?;
            parser.expect(Id)?;
            let tt = bb_id(parser.slice_prev());
            parser.expect(Comma)?;
            parser.expect(Id)?;
            let ff = bb_id(parser.slice_prev());
            Ok(Terminal::Branch { cond, tt, ff })
        }
        "$ret" => {
            if parser.next_is(Local)
                || parser.next_is(Num)
                || parser.next_is(Null)
                || parser.next_is(Undef)
                || parser.next_is(AtId)
            {
                Ok(Terminal::Ret(Some(operand_r(parser)?)))
            } else {
                Ok(Terminal::Ret(None))
            }
        }
        "$unreachable" => Ok(Terminal::Unreachable),
        other => parser.error(parser.pos - 1, &format!("unknown terminator `{other}`")),
    }
}

fn operand_r(parser: &mut Parser) -> Result<Operand, ParseError> {
    if parser.eat(Local) {
        Ok(Operand::Var(
            parser.lookup(&parser.slice_prev().to_string())?,
        ))
    } else if parser.eat(Num) {
        let n = parser
            .slice_prev()
            .parse::<i64>()
            .map_err(|e| ParseError(e.to_string()))?;
        Ok(Operand::CInt(n))
    } else if parser.eat(Null) {
        parser.expect(Colon)?;
        Ok(Operand::Null(type_r(parser)?))
    } else if parser.eat(Undef) {
        parser.expect(Colon)?;
        Ok(Operand::Undef(type_r(parser)?))
    } else if parser.eat(AtId) {
        let name = parser.slice_prev()[1..].to_string();
        match parser.globals.get(&name) {
            Some(g) => Ok(Operand::Global(g.clone())),
            None => Ok(Operand::Func(func_id(&name))),
        }
    } else {
        parser.error_next("expected an operand")
    }
}

fn arith_op_r(parser: &mut Parser) -> Result<ArithOp, ParseError> {
    parser.expect(Id)?;
    match parser.slice_prev() {
        "add" => Ok(ArithOp::Add),
        "sub" => Ok(ArithOp::Sub),
        "mul" => Ok(ArithOp::Mul),
        "div" => Ok(ArithOp::Div),
        other => parser.error(parser.pos - 1, &format!("unknown arithmetic op `{other}`")),
    }
}

fn cmp_op_r(parser: &mut Parser) -> Result<CmpOp, ParseError> {
    parser.expect(Id)?;
    match parser.slice_prev() {
        "eq" => Ok(CmpOp::Eq),
        "ne" => Ok(CmpOp::Ne),
        "lt" => Ok(CmpOp::Lt),
        "le" => Ok(CmpOp::Le),
        "gt" => Ok(CmpOp::Gt),
        "ge" => Ok(CmpOp::Ge),
        other => parser.error(parser.pos - 1, &format!("unknown comparison op `{other}`")),
    }
}

fn inst_r(parser: &mut Parser, lhs: Option<ValueId>) -> Result<Instruction, ParseError> {
    parser.expect(Op)?;
    let op = parser.slice_prev().to_string();

    // instructions that define a value
    let need_lhs = |parser: &Parser, lhs: Option<ValueId>| -> Result<ValueId, ParseError> {
        match lhs {
            Some(l) => Ok(l),
            None => parser.error(parser.pos - 1, &format!("`{op}` must define a value")),
        }
    };

    match op.as_str() {
        "$arith" => {
            let aop = arith_op_r(parser)?;
            let op1 = operand_r(parser)?;
            parser.expect(Comma)?;
            let op2 = operand_r(parser)?;
            Ok(Instruction::Arith {
                lhs: need_lhs(parser, lhs)?,
                aop,
                op1,
                op2,
            })
        }
        "$cmp" => {
            let rop = cmp_op_r(parser)?;
            let op1 = operand_r(parser)?;
            parser.expect(Comma)?;
            let op2 = operand_r(parser)?;
            Ok(Instruction::Cmp {
                lhs: need_lhs(parser, lhs)?,
                rop,
                op1,
                op2,
            })
        }
        "$bitcast" | "$inttoptr" | "$ptrtoint" => {
            let kind = match op.as_str() {
                "$bitcast" => CastKind::Bitcast,
                "$inttoptr" => CastKind::IntToPtr,
                _ => CastKind::PtrToInt,
            };
            let src = operand_r(parser)?;
            parser.expect(To)?;
            let ty = type_r(parser)?;
            let lhs = need_lhs(parser, lhs)?;
            if lhs.ty() != ty {
                return parser.error(
                    parser.pos - 1,
                    &format!("cast target type `{ty}` does not match `{lhs}:{}`", lhs.ty()),
                );
            }
            Ok(Instruction::Cast { lhs, kind, op: src })
        }
        "$gep" => {
            let base = operand_r(parser)?;
            parser.expect(Comma)?;
            let offset = operand_r(parser)?;
            Ok(Instruction::Gep {
                lhs: need_lhs(parser, lhs)?,
                base,
                offset,
            })
        }
        "$load" => Ok(Instruction::Load {
            lhs: need_lhs(parser, lhs)?,
            src: operand_r(parser)?,
        }),
        "$store" => {
            let dst = operand_r(parser)?;
            parser.expect(Comma)?;
            let val = operand_r(parser)?;
            Ok(Instruction::Store { dst, op: val })
        }
        "$alloca" => {
            let ty = type_r(parser)?;
            let lhs = need_lhs(parser, lhs)?;
            if lhs.ty().pointee() != Some(ty.clone()) {
                return parser.error(
                    parser.pos - 1,
                    &format!("alloca of `{ty}` must define a pointer to `{ty}`"),
                );
            }
            Ok(Instruction::Alloca { lhs })
        }
        "$phi" => {
            let mut args = vec![];
            loop {
                parser.expect(OpenBracket)?;
                parser.expect(Id)?;
                let bb = bb_id(parser.slice_prev());
                parser.expect(Colon)?;
                let op = operand_r(parser)?;
                parser.expect(CloseBracket)?;
                args.push((bb, op));
                if !parser.eat(Comma) {
                    break;
                }
            }
            Ok(Instruction::Phi {
                lhs: need_lhs(parser, lhs)?,
                args,
            })
        }
        "$select" => {
            let cond = operand_r(parser)?;
            parser.expect(Comma)?;
            let tt = operand_r(parser)?;
            parser.expect(Comma)?;
            let ff = operand_r(parser)?;
            Ok(Instruction::Select {
                lhs: need_lhs(parser, lhs)?,
                cond,
                tt,
                ff,
            })
        }
        "$call" => {
            let cconv = if parser.eat(Cold) {
                Some(CallConv::Cold)
            } else {
                None
            };
            parser.expect(AtId)?;
            let callee = func_id(&parser.slice_prev()[1..]);
            parser.expect(OpenParen)?;
            let mut args = vec![];
            if !parser.eat(CloseParen) {
                loop {
                    args.push(operand_r(parser)?);
                    if !parser.eat(Comma) {
                        break;
                    }
                }
                parser.expect(CloseParen)?;
            }
            let state = call_state_r(parser)?;
            Ok(Instruction::Call {
                lhs,
                cconv,
                callee,
                args,
                state,
            })
        }
        "$cmpxchg" => {
            let dst = operand_r(parser)?;
            parser.expect(Comma)?;
            let cmp = operand_r(parser)?;
            parser.expect(Comma)?;
            let new = operand_r(parser)?;
            Ok(Instruction::CmpXchg {
                lhs: need_lhs(parser, lhs)?,
                dst,
                cmp,
                new,
            })
        }
        "$atomicrmw" => {
            parser.expect(Id)?;
            let rop = match parser.slice_prev() {
                "xchg" => RmwOp::Xchg,
                "add" => RmwOp::Add,
                other => {
                    return parser.error(parser.pos - 1, &format!("unknown rmw op `{other}`"))
                }
            };
            let dst = operand_r(parser)?;
            parser.expect(Comma)?;
            let val = operand_r(parser)?;
            Ok(Instruction::AtomicRmw {
                lhs: need_lhs(parser, lhs)?,
                rop,
                dst,
                op: val,
            })
        }
        other => parser.error(parser.pos - 1, &format!("unknown instruction `{other}`")),
    }
}

fn call_state_r(parser: &mut Parser) -> Result<Option<CallState>, ParseError> {
    if !parser.eat(OpenBrace) {
        return Ok(None);
    }

    let field = |parser: &mut Parser, name: &str| -> Result<(), ParseError> {
        parser.expect(Id)?;
        if parser.slice_prev() != name {
            return parser.error(parser.pos - 1, &format!("expected `{name}`"));
        }
        parser.expect(Assign)?;
        Ok(())
    };

    let num = |parser: &mut Parser| -> Result<i64, ParseError> {
        parser.expect(Num)?;
        parser
            .slice_prev()
            .parse::<i64>()
            .map_err(|e| ParseError(e.to_string()))
    };

    let op_list = |parser: &mut Parser| -> Result<Vec<Operand>, ParseError> {
        parser.expect(OpenBracket)?;
        let mut ops = vec![];
        if !parser.eat(CloseBracket) {
            loop {
                ops.push(operand_r(parser)?);
                if !parser.eat(Comma) {
                    break;
                }
            }
            parser.expect(CloseBracket)?;
        }
        Ok(ops)
    };

    field(parser, "depth")?;
    let depth = num(parser)?;
    parser.expect(Comma)?;
    field(parser, "bci")?;
    let bci = num(parser)?;
    parser.expect(Comma)?;
    field(parser, "stack")?;
    let stack = op_list(parser)?;
    parser.expect(Comma)?;
    field(parser, "locals")?;
    let locals = op_list(parser)?;
    parser.expect(Comma)?;
    field(parser, "monitors")?;
    let monitors = op_list(parser)?;
    parser.expect(CloseBrace)?;

    Ok(Some(CallState {
        depth,
        bci,
        stack,
        locals,
        monitors,
    }))
}
