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

// Statement list -> bytecode. Addresses inside Jz/Jmp/DefMenu/DefProc must
// already be correct when this runs; resolution is the job of the text
// parser and the substitution pass, never the assembler's.

use crate::{
    game::{GameContext, IndexHeader},
    ExprOp, Game, MesExpression, MesParameter, MesStatement, MesStatementKind, StmtOp,
};
use anyhow::{bail, Result};
use log::warn;

fn stmt_opcode(ctx: &GameContext, op: StmtOp) -> Result<u8> {
    match ctx.stmt_opcode(op) {
        Some(b) => Ok(b),
        None => bail!("statement {:?} is not encodable for {}", op, ctx.game.name()),
    }
}

fn expr_opcode(ctx: &GameContext, op: ExprOp) -> Result<u8> {
    match ctx.expr_opcode(op) {
        Some(b) => Ok(b),
        None => bail!(
            "expression {:?} is not encodable for {}",
            op,
            ctx.game.name()
        ),
    }
}

/// Invert the parser's string escaping: `\XHHHH` to two raw bytes, `\xHH`
/// to one, the short escapes per the fixed table, everything else through
/// the Shift-JIS encoder.
pub(crate) fn pack_string(
    out: &mut Vec<u8>,
    text: &str,
    terminated: bool,
    term: u8,
) -> Result<()> {
    let mut chars = text.chars().peekable();
    let mut hex = |chars: &mut std::iter::Peekable<std::str::Chars>, n: usize| -> Option<u32> {
        let mut v = 0u32;
        for _ in 0..n {
            let c = chars.next()?;
            v = v * 16 + c.to_digit(16)?;
        }
        Some(v)
    };
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push(b'\n'),
                Some('t') => out.push(b'\t'),
                Some('$') => out.push(b'$'),
                Some('\\') => out.push(b'\\'),
                Some('"') => out.push(b'"'),
                Some('x') => match hex(&mut chars, 2) {
                    Some(v) => out.push(v as u8),
                    None => warn!("invalid escape sequence in string: {:?}", text),
                },
                Some('X') => match hex(&mut chars, 4) {
                    Some(v) => {
                        out.push((v >> 8) as u8);
                        out.push(v as u8);
                    }
                    None => warn!("invalid escape sequence in text: {:?}", text),
                },
                Some(c) => {
                    warn!("invalid escape sequence in string: {:?}", text);
                    let mut utf8 = [0u8; 4];
                    out.extend_from_slice(sjis::from_utf8(c.encode_utf8(&mut utf8))?.as_slice());
                }
                None => warn!("invalid escape sequence in string: {:?}", text),
            }
        } else {
            let mut utf8 = [0u8; 4];
            out.extend_from_slice(sjis::from_utf8(c.encode_utf8(&mut utf8))?.as_slice());
        }
    }
    if terminated {
        out.push(term);
    }
    Ok(())
}

fn pack_expression_inner(
    ctx: &GameContext,
    out: &mut Vec<u8>,
    expr: &MesExpression,
) -> Result<()> {
    // Doukyuusei/AIWIN rand carries its limit inline, ahead of the postfix
    // rules below.
    if let MesExpression::Rand(limit) = expr {
        if !ctx.rand_is_postfix {
            out.push(expr_opcode(ctx, ExprOp::Rand)?);
            match limit.imm_value() {
                Some(v) if v < 0x1_0000 => out.extend_from_slice(&(v as u16).to_le_bytes()),
                _ => bail!("invalid expression as rand limit"),
            }
            return Ok(());
        }
    }

    match expr {
        MesExpression::Imm8(v) => out.push(*v),
        MesExpression::Imm16(v) => {
            out.push(expr_opcode(ctx, ExprOp::Imm16)?);
            out.extend_from_slice(&v.to_le_bytes());
        }
        MesExpression::Imm32(v) => {
            out.push(expr_opcode(ctx, ExprOp::Imm32)?);
            out.extend_from_slice(&v.to_le_bytes());
        }
        MesExpression::GetVar16(n) => {
            out.push(expr_opcode(ctx, ExprOp::GetVar16)?);
            out.push(*n);
        }
        MesExpression::GetVar32(n) => {
            out.push(expr_opcode(ctx, ExprOp::GetVar32)?);
            out.push(*n);
        }
        MesExpression::GetFlagConst(n) => {
            out.push(expr_opcode(ctx, ExprOp::GetFlagConst)?);
            out.extend_from_slice(&n.to_le_bytes());
        }
        MesExpression::GetFlagExpr(index) => {
            pack_expression_inner(ctx, out, index)?;
            out.push(expr_opcode(ctx, ExprOp::GetFlagExpr)?);
        }
        MesExpression::Ptr16Get8 { var_no, index } => {
            pack_expression_inner(ctx, out, index)?;
            out.push(expr_opcode(ctx, ExprOp::Ptr16Get8)?);
            out.push(*var_no);
        }
        MesExpression::Ptr16Get16 { var_no, index } => {
            pack_expression_inner(ctx, out, index)?;
            out.push(expr_opcode(ctx, ExprOp::Ptr16Get16)?);
            out.push(*var_no);
        }
        MesExpression::Ptr32Get8 { var_no, index } => {
            pack_expression_inner(ctx, out, index)?;
            out.push(expr_opcode(ctx, ExprOp::Ptr32Get8)?);
            out.push(*var_no);
        }
        MesExpression::Ptr32Get16 { var_no, index } => {
            pack_expression_inner(ctx, out, index)?;
            out.push(expr_opcode(ctx, ExprOp::Ptr32Get16)?);
            out.push(*var_no);
        }
        MesExpression::Ptr32Get32 { var_no, index } => {
            pack_expression_inner(ctx, out, index)?;
            out.push(expr_opcode(ctx, ExprOp::Ptr32Get32)?);
            out.push(*var_no);
        }
        MesExpression::Rand(limit) => {
            pack_expression_inner(ctx, out, limit)?;
            out.push(expr_opcode(ctx, ExprOp::Rand)?);
        }
        MesExpression::Binary { op, lhs, rhs } => {
            pack_expression_inner(ctx, out, lhs)?;
            pack_expression_inner(ctx, out, rhs)?;
            out.push(expr_opcode(ctx, op.expr_op())?);
        }
    }
    Ok(())
}

fn pack_expression(ctx: &GameContext, out: &mut Vec<u8>, expr: &MesExpression) -> Result<()> {
    pack_expression_inner(ctx, out, expr)?;
    out.push(expr_opcode(ctx, ExprOp::End)?);
    Ok(())
}

fn pack_expression_list(
    ctx: &GameContext,
    out: &mut Vec<u8>,
    exprs: &[MesExpression],
) -> Result<()> {
    if exprs.is_empty() {
        out.push(ctx.list_term());
        return Ok(());
    }
    for (i, expr) in exprs.iter().enumerate() {
        pack_expression(ctx, out, expr)?;
        if i + 1 == exprs.len() {
            out.push(ctx.list_term());
        } else {
            out.push(1);
        }
    }
    Ok(())
}

fn pack_parameter_list(
    ctx: &GameContext,
    out: &mut Vec<u8>,
    params: &[MesParameter],
) -> Result<()> {
    for param in params {
        match param {
            MesParameter::Str(s) => {
                out.push(1);
                pack_string(out, s, true, 0)?;
            }
            MesParameter::Expr(e) => {
                out.push(2);
                pack_expression(ctx, out, e)?;
            }
        }
    }
    out.push(ctx.list_term());
    Ok(())
}

fn pack_statement(ctx: &GameContext, out: &mut Vec<u8>, stmt: &MesStatement) -> Result<()> {
    out.push(stmt_opcode(ctx, stmt.kind.op())?);
    match &stmt.kind {
        MesStatementKind::End => {}
        MesStatementKind::Txt(t) | MesStatementKind::Str(t) => {
            if t.unprefixed {
                out.pop();
            }
            pack_string(out, &t.text, t.terminated, ctx.string_term())?;
        }
        MesStatementKind::SetFlagConst { var_no, vals } => {
            out.extend_from_slice(&var_no.to_le_bytes());
            pack_expression_list(ctx, out, vals)?;
        }
        MesStatementKind::SetFlagExpr { var_expr, vals } => {
            pack_expression(ctx, out, var_expr)?;
            pack_expression_list(ctx, out, vals)?;
        }
        MesStatementKind::SetVar16 { var_no, vals }
        | MesStatementKind::SetVar32 { var_no, vals } => {
            out.push(*var_no);
            pack_expression_list(ctx, out, vals)?;
        }
        MesStatementKind::Ptr16Set8 { var_no, off, vals }
        | MesStatementKind::Ptr16Set16 { var_no, off, vals }
        | MesStatementKind::Ptr32Set8 { var_no, off, vals }
        | MesStatementKind::Ptr32Set16 { var_no, off, vals }
        | MesStatementKind::Ptr32Set32 { var_no, off, vals } => {
            pack_expression(ctx, out, off)?;
            out.push(*var_no);
            pack_expression_list(ctx, out, vals)?;
        }
        MesStatementKind::Jz { cond, addr } => {
            pack_expression(ctx, out, cond)?;
            out.extend_from_slice(&addr.to_le_bytes());
        }
        MesStatementKind::Jmp { addr } => out.extend_from_slice(&addr.to_le_bytes()),
        MesStatementKind::Sys { expr, params } => {
            pack_expression(ctx, out, expr)?;
            pack_parameter_list(ctx, out, params)?;
        }
        MesStatementKind::JmpMes(params)
        | MesStatementKind::CallMes(params)
        | MesStatementKind::CallProc(params)
        | MesStatementKind::Util(params) => pack_parameter_list(ctx, out, params)?,
        MesStatementKind::DefMenu { params, skip_addr } => {
            pack_parameter_list(ctx, out, params)?;
            out.extend_from_slice(&skip_addr.to_le_bytes());
        }
        MesStatementKind::DefProc { no_expr, skip_addr } => {
            pack_expression(ctx, out, no_expr)?;
            out.extend_from_slice(&skip_addr.to_le_bytes());
        }
        MesStatementKind::MenuExec(params) => {
            if ctx.game == Game::Nonomura {
                pack_parameter_list(ctx, out, params)?;
            }
        }
        MesStatementKind::Line(arg) => out.push(*arg),
    }
    Ok(())
}

/// Assemble a statement list into a .mes image, bit-exact to the on-disk
/// format of the selected game, including the variant file headers.
pub fn pack_statements(ctx: &GameContext, statements: &[MesStatement]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut proc_addrs = Vec::new();
    for stmt in statements {
        if stmt.kind.op() == StmtOp::DefProc {
            proc_addrs.push(out.len() as u32);
        }
        pack_statement(ctx, &mut out, stmt)?;
    }

    match ctx.index_header {
        IndexHeader::None => Ok(out),
        IndexHeader::KawarazakikeHeader => {
            let mut framed = Vec::with_capacity(out.len() + 4);
            framed.extend_from_slice(&[0, 0, 0, 0]);
            framed.extend_from_slice(&out);
            Ok(framed)
        }
        IndexHeader::NonomuraTable => {
            let mut framed = Vec::with_capacity(out.len() + 4 + proc_addrs.len() * 4);
            framed.extend_from_slice(&(proc_addrs.len() as u32).to_le_bytes());
            for addr in &proc_addrs {
                framed.extend_from_slice(&addr.to_le_bytes());
            }
            framed.extend_from_slice(&out);
            Ok(framed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{parse_statements, statement_size, MesText};

    fn ctx() -> &'static GameContext {
        GameContext::for_game(Game::ElfClassics)
    }

    #[test]
    fn round_trips_simple_stream() -> Result<()> {
        let bytes = vec![
            0x04, 0x01, 0x02, 0xff, 0x00, // var16[1] = 2;
            0x02, b'h', b'i', 0x00, // STR "hi"
            0x00, // END
        ];
        let stmts = parse_statements(ctx(), &bytes)?;
        assert_eq!(pack_statements(ctx(), &stmts)?, bytes);
        Ok(())
    }

    #[test]
    fn unprefixed_text_omits_opcode() -> Result<()> {
        let stmt = MesStatement::new(MesStatementKind::Str(MesText {
            text: "AB".into(),
            terminated: true,
            unprefixed: true,
        }));
        let packed = pack_statements(ctx(), &[stmt])?;
        assert_eq!(packed, b"AB\0");
        Ok(())
    }

    #[test]
    fn packed_length_matches_size() -> Result<()> {
        let bytes = vec![
            0x03, 0x10, 0x00, 0x01, 0xff, 0x00, // var4[16] = 1
            0x0d, 0x00, 0xff, 0x02, 0x05, 0xff, 0x00, // SYS[0](5)
            0x13, 0x00, // LINE 0
            0x00, // END
        ];
        let stmts = parse_statements(ctx(), &bytes)?;
        for stmt in &stmts {
            let mut out = Vec::new();
            pack_statement(ctx(), &mut out, stmt)?;
            assert_eq!(out.len() as u32, statement_size(ctx(), stmt));
            assert_eq!(stmt.next_address - stmt.address, out.len() as u32);
        }
        Ok(())
    }

    #[test]
    fn escapes_round_trip() -> Result<()> {
        let bytes = vec![
            0x02, b'a', b'\\', b'$', 0x07, 0x00, // STR with escapes
            0x00, // END
        ];
        let stmts = parse_statements(ctx(), &bytes)?;
        match &stmts[0].kind {
            MesStatementKind::Str(t) => assert_eq!(t.text, "a\\\\\\$\\x07"),
            other => panic!("unexpected statement: {:?}", other),
        }
        assert_eq!(pack_statements(ctx(), &stmts)?, bytes);
        Ok(())
    }

    #[test]
    fn kawarazakike_header_round_trips() -> Result<()> {
        let ctx = GameContext::for_game(Game::Kawarazakike);
        let bytes = vec![0, 0, 0, 0, 0x00];
        let stmts = parse_statements(ctx, &bytes)?;
        assert_eq!(pack_statements(ctx, &stmts)?, bytes);
        Ok(())
    }

    #[test]
    fn nonomura_table_lists_procedures() -> Result<()> {
        let ctx = GameContext::for_game(Game::Nonomura);
        // defproc 1 { } on the modern table: 0x12, imm 1, expr END, skip,
        // then two ENDs. The DefProc statement occupies 7 bytes, so the
        // procedure's END sits at 7 and the skip address is 8.
        let mut code = vec![0x12, 0x01, 0xff];
        code.extend_from_slice(&8u32.to_le_bytes());
        code.push(0x00); // procedure END at 7
        code.push(0x00); // toplevel END at 8

        let mut file = Vec::new();
        file.extend_from_slice(&1u32.to_le_bytes());
        file.extend_from_slice(&0u32.to_le_bytes()); // DefProc at offset 0
        file.extend_from_slice(&code);

        let stmts = parse_statements(ctx, &file)?;
        assert_eq!(pack_statements(ctx, &stmts)?, file);
        Ok(())
    }
}
