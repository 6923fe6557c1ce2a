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

// Bytecode -> flat statement list. The stream has no framing beyond the
// variant headers, so the parser walks it linearly and trusts the opcode
// table; a byte the table does not know is re-read as the start of an
// inline text run, which some titles really do emit without a prefix.

use crate::{
    game::{GameContext, IndexHeader},
    ExprOp, Game, MesExpression, MesParameter, MesStatement, MesStatementKind, MesText, StmtOp,
};
use anyhow::Result;
use log::warn;
use std::collections::HashMap;
use std::fmt::Write;
use thiserror::Error;

/// Parser conditions a caller may want to match on; everything else is a
/// plain anyhow error.
#[derive(Debug, Error)]
pub enum MesParseError {
    #[error("unexpected end of input at 0x{addr:08x}")]
    TooShort { addr: u32 },
    #[error("expression stack underflow at 0x{addr:08x}")]
    StackUnderflow { addr: u32 },
    #[error("expression stack overflow at 0x{addr:08x}")]
    StackOverflow { addr: u32 },
    #[error("expected one value on expression stack at 0x{addr:08x}, found {depth}")]
    UnbalancedExpression { addr: u32, depth: usize },
    #[error("unhandled parameter type 0x{ty:02x} at 0x{addr:08x}")]
    BadParameterType { addr: u32, ty: u8 },
    #[error("string parameter overflows parse buffer at 0x{addr:08x}")]
    StringParamOverflow { addr: u32 },
    #[error("bad index header")]
    BadIndexHeader,
    #[error("multiple statements at address 0x{addr:08x}")]
    DuplicateAddress { addr: u32 },
    #[error("jump target 0x{target:08x} (from 0x{addr:08x}) does not match any statement")]
    BadJumpTarget { addr: u32, target: u32 },
}

const EXPR_STACK_MAX: usize = 4096;

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn addr(&self) -> u32 {
        self.pos as u32
    }

    fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn peek(&self) -> Result<u8, MesParseError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(MesParseError::TooShort { addr: self.addr() })
    }

    fn peek_at(&self, off: usize) -> Option<u8> {
        self.data.get(self.pos + off).copied()
    }

    fn u8(&mut self) -> Result<u8, MesParseError> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, MesParseError> {
        if self.remaining() < 2 {
            return Err(MesParseError::TooShort { addr: self.addr() });
        }
        let v = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    fn u32(&mut self) -> Result<u32, MesParseError> {
        if self.remaining() < 4 {
            return Err(MesParseError::TooShort { addr: self.addr() });
        }
        let v = u32::from_le_bytes([
            self.data[self.pos],
            self.data[self.pos + 1],
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(v)
    }
}

fn pop(stack: &mut Vec<MesExpression>, addr: u32) -> Result<Box<MesExpression>, MesParseError> {
    match stack.pop() {
        Some(e) => Ok(Box::new(e)),
        None => {
            warn!("At 0x{:08x}: expression stack empty", addr);
            Err(MesParseError::StackUnderflow { addr })
        }
    }
}

fn parse_expression(ctx: &GameContext, r: &mut Reader) -> Result<MesExpression, MesParseError> {
    let mut stack: Vec<MesExpression> = Vec::new();
    loop {
        if stack.len() >= EXPR_STACK_MAX {
            return Err(MesParseError::StackOverflow { addr: r.addr() });
        }
        let op_addr = r.addr();
        let b = r.u8()?;
        let expr = match ctx.expr_op(b) {
            ExprOp::Imm => MesExpression::Imm8(b),
            ExprOp::Imm16 => MesExpression::Imm16(r.u16()?),
            ExprOp::Imm32 => MesExpression::Imm32(r.u32()?),
            ExprOp::GetVar16 => MesExpression::GetVar16(r.u8()?),
            ExprOp::GetVar32 => MesExpression::GetVar32(r.u8()?),
            ExprOp::GetFlagConst => MesExpression::GetFlagConst(r.u16()?),
            ExprOp::GetFlagExpr => MesExpression::GetFlagExpr(pop(&mut stack, op_addr)?),
            ExprOp::Ptr16Get8 => MesExpression::Ptr16Get8 {
                var_no: r.u8()?,
                index: pop(&mut stack, op_addr)?,
            },
            ExprOp::Ptr16Get16 => MesExpression::Ptr16Get16 {
                var_no: r.u8()?,
                index: pop(&mut stack, op_addr)?,
            },
            ExprOp::Ptr32Get8 => MesExpression::Ptr32Get8 {
                var_no: r.u8()?,
                index: pop(&mut stack, op_addr)?,
            },
            ExprOp::Ptr32Get16 => MesExpression::Ptr32Get16 {
                var_no: r.u8()?,
                index: pop(&mut stack, op_addr)?,
            },
            ExprOp::Ptr32Get32 => MesExpression::Ptr32Get32 {
                var_no: r.u8()?,
                index: pop(&mut stack, op_addr)?,
            },
            ExprOp::Rand => {
                // Doukyuusei (and the AIWIN titles) take the limit as an
                // inline immediate rather than a popped operand.
                if ctx.rand_is_postfix {
                    MesExpression::Rand(pop(&mut stack, op_addr)?)
                } else {
                    MesExpression::Rand(Box::new(MesExpression::Imm16(r.u16()?)))
                }
            }
            ExprOp::End => {
                if stack.len() != 1 {
                    warn!("At 0x{:08x}: invalid stack size at END expression", op_addr);
                    return Err(MesParseError::UnbalancedExpression {
                        addr: op_addr,
                        depth: stack.len(),
                    });
                }
                return Ok(stack.pop().unwrap());
            }
            op => {
                let binary = op.binary().expect("non-binary expression op unhandled");
                let rhs = pop(&mut stack, op_addr)?;
                let lhs = pop(&mut stack, op_addr)?;
                MesExpression::Binary {
                    op: binary,
                    lhs,
                    rhs,
                }
            }
        };
        stack.push(expr);
    }
}

fn parse_expression_list(
    ctx: &GameContext,
    r: &mut Reader,
) -> Result<Vec<MesExpression>, MesParseError> {
    let mut exprs = Vec::new();
    loop {
        exprs.push(parse_expression(ctx, r)?);
        if r.u8()? == ctx.list_term() {
            return Ok(exprs);
        }
    }
}

fn parse_string_param(r: &mut Reader) -> Result<String, MesParseError> {
    let start = r.addr();
    let mut raw = Vec::new();
    let mut warned = false;
    loop {
        let c = r.u8()?;
        if c == 0 {
            break;
        }
        if raw.len() > 62 {
            return Err(MesParseError::StringParamOverflow { addr: r.addr() });
        }
        if raw.len() > 22 && !warned {
            warn!(
                "At 0x{:08x}: string parameter would overflow VM buffer",
                r.addr()
            );
            warned = true;
        }
        raw.push(c);
    }
    match sjis::to_utf8(&raw) {
        Ok(s) => Ok(s),
        Err(_) => {
            warn!("At 0x{:08x}: invalid bytes in string parameter", start);
            let mut s = String::new();
            for &b in &raw {
                if (0x20..=0x7e).contains(&b) {
                    s.push(b as char);
                } else {
                    write!(s, "\\x{:02x}", b).unwrap();
                }
            }
            Ok(s)
        }
    }
}

fn parse_parameter_list(
    ctx: &GameContext,
    r: &mut Reader,
) -> Result<Vec<MesParameter>, MesParseError> {
    let mut params = Vec::new();
    loop {
        let addr = r.addr();
        let ty = r.u8()?;
        if ty == ctx.list_term() {
            return Ok(params);
        }
        match ty {
            1 => params.push(MesParameter::Str(parse_string_param(r)?)),
            2 => params.push(MesParameter::Expr(parse_expression(ctx, r)?)),
            _ => return Err(MesParseError::BadParameterType { addr, ty }),
        }
    }
}

/// Decode a zenkaku run. Invalid Shift-JIS pairs become `\XHHHH` escapes;
/// a run cut short by something that is not a valid lead byte is marked
/// unterminated and round-trips without its terminator.
fn parse_txt(ctx: &GameContext, r: &mut Reader) -> Result<MesText, MesParseError> {
    let term = ctx.string_term();
    // Shift-JIS pairs plus pure-ASCII escape sequences; converted once at
    // the end of the run.
    let mut buf: Vec<u8> = Vec::new();
    let mut terminated = false;
    loop {
        if r.at_end() {
            warn!("At 0x{:08x}: TXT statement truncated", r.addr());
            break;
        }
        let c = r.peek()?;
        if c == term {
            r.u8()?;
            terminated = true;
            break;
        }
        if !sjis::is_zenkaku(c) {
            warn!(
                "At 0x{:08x}: invalid byte in TXT statement: {:02x}",
                r.addr(),
                c
            );
            break;
        }
        if r.remaining() < 2 {
            warn!("At 0x{:08x}: TXT statement truncated", r.addr());
            r.u8()?;
            break;
        }
        let hi = r.u8()?;
        let lo = r.u8()?;
        if sjis::pair_is_valid(hi, lo) {
            buf.push(hi);
            buf.push(lo);
        } else {
            warn!(
                "At 0x{:08x}: invalid Shift-JIS pair: {:02x}{:02x}",
                r.addr() - 2,
                hi,
                lo
            );
            let mut esc = String::new();
            write!(esc, "\\X{:02x}{:02x}", hi, lo).unwrap();
            buf.extend_from_slice(esc.as_bytes());
        }
    }
    // Only validated pairs and ASCII escape text reach the buffer.
    let text = sjis::to_utf8(&buf).expect("validated Shift-JIS run");
    Ok(MesText {
        text,
        terminated,
        unprefixed: false,
    })
}

/// Decode a hankaku run into printable ASCII with escapes.
fn parse_str(ctx: &GameContext, r: &mut Reader) -> Result<MesText, MesParseError> {
    let term = ctx.string_term();
    let mut text = String::new();
    let mut terminated = false;
    loop {
        if r.at_end() {
            warn!("At 0x{:08x}: STR statement truncated", r.addr());
            break;
        }
        let c = r.peek()?;
        if c == term {
            r.u8()?;
            terminated = true;
            break;
        }
        if !sjis::is_hankaku(c) {
            warn!(
                "At 0x{:08x}: invalid byte in STR statement: {:02x}",
                r.addr(),
                c
            );
            break;
        }
        r.u8()?;
        match c {
            b'\n' => text.push_str("\\n"),
            b'\t' => text.push_str("\\t"),
            b'$' => text.push_str("\\$"),
            b'\\' => text.push_str("\\\\"),
            b'"' => text.push_str("\\\""),
            c if (0x20..=0x7e).contains(&c) => text.push(c as char),
            c => write!(text, "\\x{:02x}", c).unwrap(),
        }
    }
    Ok(MesText {
        text,
        terminated,
        unprefixed: false,
    })
}

fn parse_statement(ctx: &GameContext, r: &mut Reader) -> Result<MesStatement, MesParseError> {
    let address = r.addr();
    let b = r.u8()?;
    let kind = match ctx.stmt_op(b) {
        Some(StmtOp::End) => MesStatementKind::End,
        Some(StmtOp::Txt) => MesStatementKind::Txt(parse_txt(ctx, r)?),
        Some(StmtOp::Str) => MesStatementKind::Str(parse_str(ctx, r)?),
        Some(StmtOp::SetFlagConst) => MesStatementKind::SetFlagConst {
            var_no: r.u16()?,
            vals: parse_expression_list(ctx, r)?,
        },
        Some(StmtOp::SetFlagExpr) => MesStatementKind::SetFlagExpr {
            var_expr: parse_expression(ctx, r)?,
            vals: parse_expression_list(ctx, r)?,
        },
        Some(StmtOp::SetVar16) => MesStatementKind::SetVar16 {
            var_no: r.u8()?,
            vals: parse_expression_list(ctx, r)?,
        },
        Some(StmtOp::SetVar32) => MesStatementKind::SetVar32 {
            var_no: r.u8()?,
            vals: parse_expression_list(ctx, r)?,
        },
        Some(StmtOp::Ptr16Set8) => {
            let off = parse_expression(ctx, r)?;
            MesStatementKind::Ptr16Set8 {
                off,
                var_no: r.u8()?,
                vals: parse_expression_list(ctx, r)?,
            }
        }
        Some(StmtOp::Ptr16Set16) => {
            let off = parse_expression(ctx, r)?;
            MesStatementKind::Ptr16Set16 {
                off,
                var_no: r.u8()?,
                vals: parse_expression_list(ctx, r)?,
            }
        }
        Some(StmtOp::Ptr32Set8) => {
            let off = parse_expression(ctx, r)?;
            MesStatementKind::Ptr32Set8 {
                off,
                var_no: r.u8()?,
                vals: parse_expression_list(ctx, r)?,
            }
        }
        Some(StmtOp::Ptr32Set16) => {
            let off = parse_expression(ctx, r)?;
            MesStatementKind::Ptr32Set16 {
                off,
                var_no: r.u8()?,
                vals: parse_expression_list(ctx, r)?,
            }
        }
        Some(StmtOp::Ptr32Set32) => {
            let off = parse_expression(ctx, r)?;
            MesStatementKind::Ptr32Set32 {
                off,
                var_no: r.u8()?,
                vals: parse_expression_list(ctx, r)?,
            }
        }
        Some(StmtOp::Jz) => MesStatementKind::Jz {
            cond: parse_expression(ctx, r)?,
            addr: r.u32()?,
        },
        Some(StmtOp::Jmp) => MesStatementKind::Jmp { addr: r.u32()? },
        Some(StmtOp::Sys) => MesStatementKind::Sys {
            expr: parse_expression(ctx, r)?,
            params: parse_parameter_list(ctx, r)?,
        },
        Some(StmtOp::JmpMes) => MesStatementKind::JmpMes(parse_parameter_list(ctx, r)?),
        Some(StmtOp::CallMes) => MesStatementKind::CallMes(parse_parameter_list(ctx, r)?),
        Some(StmtOp::CallProc) => MesStatementKind::CallProc(parse_parameter_list(ctx, r)?),
        Some(StmtOp::Util) => MesStatementKind::Util(parse_parameter_list(ctx, r)?),
        Some(StmtOp::DefMenu) => {
            let params = parse_parameter_list(ctx, r)?;
            MesStatementKind::DefMenu {
                params,
                skip_addr: r.u32()?,
            }
        }
        Some(StmtOp::DefProc) => {
            let no_expr = parse_expression(ctx, r)?;
            MesStatementKind::DefProc {
                no_expr,
                skip_addr: r.u32()?,
            }
        }
        Some(StmtOp::MenuExec) => {
            if ctx.game == Game::Nonomura {
                MesStatementKind::MenuExec(parse_parameter_list(ctx, r)?)
            } else {
                MesStatementKind::MenuExec(Vec::new())
            }
        }
        Some(StmtOp::Line) => MesStatementKind::Line(r.u8()?),
        None => {
            // Tolerant path: reinterpret the byte as the start of a raw
            // text run without an opcode prefix.
            r.pos -= 1;
            warn!(
                "At 0x{:08x}: unprefixed text: 0x{:02x} (possibly unhandled statement)",
                address, b
            );
            let mut text = if sjis::is_hankaku(b) {
                MesStatementKind::Str(parse_str(ctx, r)?)
            } else {
                MesStatementKind::Txt(parse_txt(ctx, r)?)
            };
            match &mut text {
                MesStatementKind::Txt(t) | MesStatementKind::Str(t) => t.unprefixed = true,
                _ => unreachable!(),
            }
            text
        }
    };
    Ok(MesStatement {
        address,
        next_address: r.addr(),
        is_jump_target: false,
        kind,
    })
}

/// Second pass over the parsed list: resolve every referenced address to a
/// statement and flag it. A target that matches no statement address is
/// fatal, which guarantees the CFG builder never sees a dangling edge.
pub(crate) fn tag_jump_targets(statements: &mut [MesStatement]) -> Result<(), MesParseError> {
    let mut table: HashMap<u32, usize> = HashMap::with_capacity(statements.len());
    for (i, stmt) in statements.iter().enumerate() {
        if table.insert(stmt.address, i).is_some() {
            return Err(MesParseError::DuplicateAddress { addr: stmt.address });
        }
    }
    let mut targets = Vec::new();
    for stmt in statements.iter() {
        if let Some(target) = stmt.kind.target_addr() {
            match table.get(&target) {
                Some(&i) => targets.push(i),
                None => {
                    return Err(MesParseError::BadJumpTarget {
                        addr: stmt.address,
                        target,
                    })
                }
            }
        }
    }
    for i in targets {
        statements[i].is_jump_target = true;
    }
    Ok(())
}

/// Length of the variant-specific prefix ahead of the statement stream.
/// Statement addresses are relative to the end of this prefix.
fn index_header_len(ctx: &GameContext, data: &[u8]) -> Result<usize, MesParseError> {
    match ctx.index_header {
        IndexHeader::None => Ok(0),
        IndexHeader::KawarazakikeHeader => {
            if data.len() < 4 {
                return Err(MesParseError::BadIndexHeader);
            }
            Ok(4)
        }
        IndexHeader::NonomuraTable => {
            if data.len() < 4 {
                return Err(MesParseError::BadIndexHeader);
            }
            let count = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
            let len = 4 + count * 4;
            if data.len() < len {
                return Err(MesParseError::BadIndexHeader);
            }
            Ok(len)
        }
    }
}

/// Parse a complete .mes file into its flat, address-tagged statement list.
pub fn parse_statements(ctx: &GameContext, data: &[u8]) -> Result<Vec<MesStatement>> {
    let skip = index_header_len(ctx, data)?;
    let mut r = Reader::new(&data[skip..]);
    let mut statements = Vec::new();
    while !r.at_end() {
        statements.push(parse_statement(ctx, &mut r)?);
    }
    tag_jump_targets(&mut statements)?;
    Ok(statements)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BinaryOp;

    fn ctx() -> &'static GameContext {
        GameContext::for_game(Game::ElfClassics)
    }

    #[test]
    fn parses_end_only() -> Result<()> {
        let stmts = parse_statements(ctx(), &[0x00])?;
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].kind, MesStatementKind::End);
        assert_eq!(stmts[0].address, 0);
        assert_eq!(stmts[0].next_address, 1);
        Ok(())
    }

    #[test]
    fn parses_postfix_expression() -> Result<()> {
        // var16[0] == 1, as the condition of a JZ to the END.
        let bytes = [
            0x0b, // JZ
            0x80, 0x00, // var16[0]
            0x01, // imm 1
            0xef, // ==
            0xff, // expr END
            0x0b, 0x00, 0x00, 0x00, // target
            0x00, // END statement (address 0x0a... padded below)
        ];
        // Fix the target to the actual END address.
        let mut bytes = bytes.to_vec();
        let end_addr = (bytes.len() - 1) as u32;
        bytes[6..10].copy_from_slice(&end_addr.to_le_bytes());

        let stmts = parse_statements(ctx(), &bytes)?;
        assert_eq!(stmts.len(), 2);
        match &stmts[0].kind {
            MesStatementKind::Jz { cond, addr } => {
                assert_eq!(*addr, end_addr);
                match cond {
                    MesExpression::Binary { op, lhs, rhs } => {
                        assert_eq!(*op, BinaryOp::Eq);
                        assert_eq!(**lhs, MesExpression::GetVar16(0));
                        assert_eq!(**rhs, MesExpression::Imm8(1));
                    }
                    other => panic!("unexpected condition: {:?}", other),
                }
            }
            other => panic!("unexpected statement: {:?}", other),
        }
        assert!(stmts[1].is_jump_target);
        Ok(())
    }

    #[test]
    fn rejects_dangling_jump() {
        let bytes = [
            0x0c, 0xff, 0x00, 0x00, 0x00, // JMP 0xff
            0x00, // END
        ];
        assert!(parse_statements(ctx(), &bytes).is_err());
    }

    #[test]
    fn recovers_unprefixed_hankaku_text() -> Result<()> {
        // 'A' is not a statement opcode in any table; the parser must fall
        // back to a hankaku run.
        let bytes = [b'A', b'B', 0x00, 0x00];
        let stmts = parse_statements(ctx(), &bytes)?;
        assert_eq!(stmts.len(), 2);
        match &stmts[0].kind {
            MesStatementKind::Str(t) => {
                assert_eq!(t.text, "AB");
                assert!(t.terminated);
                assert!(t.unprefixed);
            }
            other => panic!("unexpected statement: {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn decodes_zenkaku_text() -> Result<()> {
        // TXT "あい" END
        let bytes = [0x01, 0x82, 0xa0, 0x82, 0xa2, 0x00, 0x00];
        let stmts = parse_statements(ctx(), &bytes)?;
        match &stmts[0].kind {
            MesStatementKind::Txt(t) => {
                assert_eq!(t.text, "あい");
                assert!(t.terminated);
                assert!(!t.unprefixed);
            }
            other => panic!("unexpected statement: {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn escapes_invalid_sjis_pair() -> Result<()> {
        let bytes = [0x01, 0x82, 0x3f, 0x00, 0x00];
        let stmts = parse_statements(ctx(), &bytes)?;
        match &stmts[0].kind {
            MesStatementKind::Txt(t) => assert_eq!(t.text, "\\X823f"),
            other => panic!("unexpected statement: {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn unterminated_string_is_flagged() -> Result<()> {
        // File ends mid-string: no terminator byte to consume.
        let bytes = [0x02, b'A'];
        let stmts = parse_statements(ctx(), &bytes)?;
        match &stmts[0].kind {
            MesStatementKind::Str(t) => {
                assert_eq!(t.text, "A");
                assert!(!t.terminated);
            }
            other => panic!("unexpected statement: {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn doukyuusei_rand_is_inline() -> Result<()> {
        let ctx = GameContext::for_game(Game::Doukyuusei);
        // SETV[0] = rand(100): opcode 0x04, var 0, rand 0xe5 + u16, END expr,
        // list terminator.
        let bytes = [0x04, 0x00, 0xe5, 0x64, 0x00, 0xff, 0x00, 0x00];
        let stmts = parse_statements(ctx, &bytes)?;
        match &stmts[0].kind {
            MesStatementKind::SetVar16 { var_no, vals } => {
                assert_eq!(*var_no, 0);
                assert_eq!(
                    vals[0],
                    MesExpression::Rand(Box::new(MesExpression::Imm16(100)))
                );
            }
            other => panic!("unexpected statement: {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn nonomura_header_is_skipped() -> Result<()> {
        let ctx = GameContext::for_game(Game::Nonomura);
        // count=1, one table entry, then END.
        let bytes = [0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        let stmts = parse_statements(ctx, &bytes)?;
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].address, 0);
        Ok(())
    }
}
