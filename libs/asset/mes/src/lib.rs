// This file is part of OpenSilky.
//
// OpenSilky is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// OpenSilky is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with OpenSilky.  If not, see <http://www.gnu.org/licenses/>.

//! The .mes bytecode format: parser, assembler, decompiler and text
//! substitution for the AI5WIN / AIWIN script engines.
//!
//! The pipeline is strictly one-way in each direction:
//!
//! ```text
//! decompile:  bytes -> parse -> statements -> cfg -> ast -> print
//! recompile:  text  -> smes  -> statements -> size -> pack -> bytes
//! ```
//!
//! Text substitution composes both: parse the original bytecode, splice new
//! text statements in by position, recompute every address through the size
//! calculator, then reassemble.

mod ast;
mod cfg;
mod game;
mod pack;
mod parse;
mod print;
mod size;
mod smes;
mod system;
mod text;

pub use crate::{
    ast::{decompile, decompile_blocks},
    cfg::{BlockId, MesBasicBlock, MesBlock, MesBlockKind, MesCfg, MesCompoundBlock},
    game::{Game, GameContext, IndexHeader, Variant, Vop},
    pack::pack_statements,
    parse::{parse_statements, MesParseError},
    print::{
        print_ast, print_blocks, print_block_tree, print_flat_statements, print_statement,
    },
    size::statement_size,
    smes::parse_smes,
    system::{resolve_syscall, resolve_sysvar, system_var16_name, system_var32_name, QnamePart},
    text::{
        parse_text_subs, print_text_template, substitute_text, MesTextLine, MesTextSub,
        MesTextSubList,
    },
};

/// Address given to statements that were synthesized by the decompiler and
/// therefore never existed in the input stream.
pub const SYNTHETIC_ADDRESS: u32 = 0xFFFF_FFFF;

/// Virtual statement opcodes. These do not correspond to the on-disk bytes
/// of any particular game; `GameContext` owns the mapping in each direction.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum StmtOp {
    End,
    Txt,
    Str,
    SetFlagConst,
    SetFlagExpr,
    SetVar16,
    SetVar32,
    Ptr16Set8,
    Ptr16Set16,
    Ptr32Set8,
    Ptr32Set16,
    Ptr32Set32,
    Jz,
    Jmp,
    Sys,
    JmpMes,
    CallMes,
    CallProc,
    Util,
    DefMenu,
    DefProc,
    MenuExec,
    Line,
}

impl StmtOp {
    pub(crate) const COUNT: usize = 23;

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Virtual expression opcodes, same caveat as [`StmtOp`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ExprOp {
    Imm,
    GetVar16,
    GetVar32,
    GetFlagConst,
    GetFlagExpr,
    Ptr16Get8,
    Ptr16Get16,
    Ptr32Get8,
    Ptr32Get16,
    Ptr32Get32,
    Rand,
    Plus,
    Minus,
    Mul,
    Div,
    Mod,
    LogAnd,
    LogOr,
    BitAnd,
    BitIor,
    BitXor,
    Lt,
    Gt,
    Lte,
    Gte,
    Eq,
    Neq,
    Imm16,
    Imm32,
    End,
}

impl ExprOp {
    pub(crate) const COUNT: usize = 30;

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    pub fn binary(self) -> Option<BinaryOp> {
        Some(match self {
            ExprOp::Plus => BinaryOp::Add,
            ExprOp::Minus => BinaryOp::Sub,
            ExprOp::Mul => BinaryOp::Mul,
            ExprOp::Div => BinaryOp::Div,
            ExprOp::Mod => BinaryOp::Mod,
            ExprOp::LogAnd => BinaryOp::LogAnd,
            ExprOp::LogOr => BinaryOp::LogOr,
            ExprOp::BitAnd => BinaryOp::BitAnd,
            ExprOp::BitIor => BinaryOp::BitIor,
            ExprOp::BitXor => BinaryOp::BitXor,
            ExprOp::Lt => BinaryOp::Lt,
            ExprOp::Gt => BinaryOp::Gt,
            ExprOp::Lte => BinaryOp::Lte,
            ExprOp::Gte => BinaryOp::Gte,
            ExprOp::Eq => BinaryOp::Eq,
            ExprOp::Neq => BinaryOp::Neq,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    LogAnd,
    LogOr,
    BitAnd,
    BitIor,
    BitXor,
    Lt,
    Gt,
    Lte,
    Gte,
    Eq,
    Neq,
}

impl BinaryOp {
    pub fn expr_op(self) -> ExprOp {
        match self {
            BinaryOp::Add => ExprOp::Plus,
            BinaryOp::Sub => ExprOp::Minus,
            BinaryOp::Mul => ExprOp::Mul,
            BinaryOp::Div => ExprOp::Div,
            BinaryOp::Mod => ExprOp::Mod,
            BinaryOp::LogAnd => ExprOp::LogAnd,
            BinaryOp::LogOr => ExprOp::LogOr,
            BinaryOp::BitAnd => ExprOp::BitAnd,
            BinaryOp::BitIor => ExprOp::BitIor,
            BinaryOp::BitXor => ExprOp::BitXor,
            BinaryOp::Lt => ExprOp::Lt,
            BinaryOp::Gt => ExprOp::Gt,
            BinaryOp::Lte => ExprOp::Lte,
            BinaryOp::Gte => ExprOp::Gte,
            BinaryOp::Eq => ExprOp::Eq,
            BinaryOp::Neq => ExprOp::Neq,
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::LogAnd => "&&",
            BinaryOp::LogOr => "||",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitIor => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Lte => "<=",
            BinaryOp::Gte => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Neq => "!=",
        }
    }
}

/// An expression tree. The on-disk form is postfix: sub-trees first, then
/// the node's own opcode and inline operands, with a terminating END byte
/// at the outermost level.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MesExpression {
    Imm8(u8),
    Imm16(u16),
    Imm32(u32),
    /// var16[n]
    GetVar16(u8),
    /// var32[n]
    GetVar32(u8),
    /// var4[n], inline 16-bit index
    GetFlagConst(u16),
    /// var4[expr]
    GetFlagExpr(Box<MesExpression>),
    /// var16[n]->byte[expr]
    Ptr16Get8 { var_no: u8, index: Box<MesExpression> },
    /// var16[n-1]->word[expr]; var_no 0 addresses the system variables
    Ptr16Get16 { var_no: u8, index: Box<MesExpression> },
    /// var32[n-1]->byte[expr]
    Ptr32Get8 { var_no: u8, index: Box<MesExpression> },
    /// var32[n-1]->word[expr]
    Ptr32Get16 { var_no: u8, index: Box<MesExpression> },
    /// var32[n-1]->dword[expr]; var_no 0 addresses the system pointers
    Ptr32Get32 { var_no: u8, index: Box<MesExpression> },
    Rand(Box<MesExpression>),
    Binary {
        op: BinaryOp,
        lhs: Box<MesExpression>,
        rhs: Box<MesExpression>,
    },
}

impl MesExpression {
    pub fn op(&self) -> ExprOp {
        match self {
            MesExpression::Imm8(_) => ExprOp::Imm,
            MesExpression::Imm16(_) => ExprOp::Imm16,
            MesExpression::Imm32(_) => ExprOp::Imm32,
            MesExpression::GetVar16(_) => ExprOp::GetVar16,
            MesExpression::GetVar32(_) => ExprOp::GetVar32,
            MesExpression::GetFlagConst(_) => ExprOp::GetFlagConst,
            MesExpression::GetFlagExpr(_) => ExprOp::GetFlagExpr,
            MesExpression::Ptr16Get8 { .. } => ExprOp::Ptr16Get8,
            MesExpression::Ptr16Get16 { .. } => ExprOp::Ptr16Get16,
            MesExpression::Ptr32Get8 { .. } => ExprOp::Ptr32Get8,
            MesExpression::Ptr32Get16 { .. } => ExprOp::Ptr32Get16,
            MesExpression::Ptr32Get32 { .. } => ExprOp::Ptr32Get32,
            MesExpression::Rand(_) => ExprOp::Rand,
            MesExpression::Binary { op, .. } => op.expr_op(),
        }
    }

    /// Smallest immediate encoding for a constant, as the original compiler
    /// picks it: bytes below 0x80 inline into the opcode position.
    pub fn imm(value: u32) -> Self {
        if value < 0x80 {
            MesExpression::Imm8(value as u8)
        } else if value < 0x1_0000 {
            MesExpression::Imm16(value as u16)
        } else {
            MesExpression::Imm32(value)
        }
    }

    pub fn imm_value(&self) -> Option<u32> {
        match self {
            MesExpression::Imm8(v) => Some(u32::from(*v)),
            MesExpression::Imm16(v) => Some(u32::from(*v)),
            MesExpression::Imm32(v) => Some(*v),
            _ => None,
        }
    }
}

/// String payload shared by the zenkaku (Txt) and hankaku (Str) statements.
///
/// `terminated` records whether the run ended in a NUL on disk; `unprefixed`
/// records that the opcode byte was absent and the parser recovered the run
/// from raw text bytes. Both round-trip exactly.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MesText {
    pub text: String,
    pub terminated: bool,
    pub unprefixed: bool,
}

impl MesText {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            terminated: true,
            unprefixed: false,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MesParameter {
    Str(String),
    Expr(MesExpression),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MesStatementKind {
    End,
    /// Zenkaku text run.
    Txt(MesText),
    /// Hankaku text run.
    Str(MesText),
    SetFlagConst {
        var_no: u16,
        vals: Vec<MesExpression>,
    },
    SetFlagExpr {
        var_expr: MesExpression,
        vals: Vec<MesExpression>,
    },
    SetVar16 {
        var_no: u8,
        vals: Vec<MesExpression>,
    },
    SetVar32 {
        var_no: u8,
        vals: Vec<MesExpression>,
    },
    Ptr16Set8 {
        var_no: u8,
        off: MesExpression,
        vals: Vec<MesExpression>,
    },
    Ptr16Set16 {
        var_no: u8,
        off: MesExpression,
        vals: Vec<MesExpression>,
    },
    Ptr32Set8 {
        var_no: u8,
        off: MesExpression,
        vals: Vec<MesExpression>,
    },
    Ptr32Set16 {
        var_no: u8,
        off: MesExpression,
        vals: Vec<MesExpression>,
    },
    Ptr32Set32 {
        var_no: u8,
        off: MesExpression,
        vals: Vec<MesExpression>,
    },
    Jz {
        cond: MesExpression,
        addr: u32,
    },
    Jmp {
        addr: u32,
    },
    Sys {
        expr: MesExpression,
        params: Vec<MesParameter>,
    },
    JmpMes(Vec<MesParameter>),
    CallMes(Vec<MesParameter>),
    CallProc(Vec<MesParameter>),
    Util(Vec<MesParameter>),
    DefMenu {
        params: Vec<MesParameter>,
        skip_addr: u32,
    },
    DefProc {
        no_expr: MesExpression,
        skip_addr: u32,
    },
    /// Parameters are packed for Nonomura only.
    MenuExec(Vec<MesParameter>),
    Line(u8),
}

impl MesStatementKind {
    pub fn op(&self) -> StmtOp {
        match self {
            MesStatementKind::End => StmtOp::End,
            MesStatementKind::Txt(_) => StmtOp::Txt,
            MesStatementKind::Str(_) => StmtOp::Str,
            MesStatementKind::SetFlagConst { .. } => StmtOp::SetFlagConst,
            MesStatementKind::SetFlagExpr { .. } => StmtOp::SetFlagExpr,
            MesStatementKind::SetVar16 { .. } => StmtOp::SetVar16,
            MesStatementKind::SetVar32 { .. } => StmtOp::SetVar32,
            MesStatementKind::Ptr16Set8 { .. } => StmtOp::Ptr16Set8,
            MesStatementKind::Ptr16Set16 { .. } => StmtOp::Ptr16Set16,
            MesStatementKind::Ptr32Set8 { .. } => StmtOp::Ptr32Set8,
            MesStatementKind::Ptr32Set16 { .. } => StmtOp::Ptr32Set16,
            MesStatementKind::Ptr32Set32 { .. } => StmtOp::Ptr32Set32,
            MesStatementKind::Jz { .. } => StmtOp::Jz,
            MesStatementKind::Jmp { .. } => StmtOp::Jmp,
            MesStatementKind::Sys { .. } => StmtOp::Sys,
            MesStatementKind::JmpMes(_) => StmtOp::JmpMes,
            MesStatementKind::CallMes(_) => StmtOp::CallMes,
            MesStatementKind::CallProc(_) => StmtOp::CallProc,
            MesStatementKind::Util(_) => StmtOp::Util,
            MesStatementKind::DefMenu { .. } => StmtOp::DefMenu,
            MesStatementKind::DefProc { .. } => StmtOp::DefProc,
            MesStatementKind::MenuExec(_) => StmtOp::MenuExec,
            MesStatementKind::Line(_) => StmtOp::Line,
        }
    }

    /// The address operand this statement points at, if it has one: jump
    /// targets for Jz/Jmp, skip addresses for DefMenu/DefProc.
    pub fn target_addr(&self) -> Option<u32> {
        match self {
            MesStatementKind::Jz { addr, .. }
            | MesStatementKind::Jmp { addr }
            | MesStatementKind::DefMenu {
                skip_addr: addr, ..
            }
            | MesStatementKind::DefProc {
                skip_addr: addr, ..
            } => Some(*addr),
            _ => None,
        }
    }

    pub fn target_addr_mut(&mut self) -> Option<&mut u32> {
        match self {
            MesStatementKind::Jz { addr, .. }
            | MesStatementKind::Jmp { addr }
            | MesStatementKind::DefMenu {
                skip_addr: addr, ..
            }
            | MesStatementKind::DefProc {
                skip_addr: addr, ..
            } => Some(addr),
            _ => None,
        }
    }
}

/// A single parsed statement. `address` is the exact byte offset the
/// statement occupies in the packed stream and `next_address` is always
/// `address + packed_size`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MesStatement {
    pub address: u32,
    pub next_address: u32,
    pub is_jump_target: bool,
    pub kind: MesStatementKind,
}

impl MesStatement {
    pub fn new(kind: MesStatementKind) -> Self {
        Self {
            address: 0,
            next_address: 0,
            is_jump_target: false,
            kind,
        }
    }

    pub fn synthetic(kind: MesStatementKind) -> Self {
        Self {
            address: SYNTHETIC_ADDRESS,
            next_address: SYNTHETIC_ADDRESS,
            is_jump_target: false,
            kind,
        }
    }
}

/// A node of the reconstructed syntax tree. `address` is the address of the
/// statement the node originated from, used to anchor `L_xxxxxxxx:` labels
/// when a surviving goto points at the node.
#[derive(Clone, Debug, PartialEq)]
pub struct MesAstNode {
    pub address: u32,
    pub is_goto_target: bool,
    pub kind: MesAstKind,
}

impl MesAstNode {
    pub(crate) fn new(address: u32, kind: MesAstKind) -> Self {
        Self {
            address,
            is_goto_target: false,
            kind,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MesAstKind {
    Statements(Vec<MesStatement>),
    Cond {
        condition: MesExpression,
        consequent: Vec<MesAstNode>,
        alternative: Vec<MesAstNode>,
    },
    Loop {
        condition: MesExpression,
        body: Vec<MesAstNode>,
    },
    Procedure {
        num_expr: MesExpression,
        body: Vec<MesAstNode>,
    },
    MenuEntry {
        params: Vec<MesParameter>,
        body: Vec<MesAstNode>,
    },
    Continue,
    Break,
}
