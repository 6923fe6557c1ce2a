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

// .smes text -> statement list. One grammar covers both printer outputs:
// the flat listing (labels, raw jz/goto/defproc) and the structured form
// (if/else/while/break/continue, procedure and menu blocks), which lowers
// to Jz/Jmp with generated labels. Addresses are assigned afterwards from
// the size calculator and every label reference is back-patched, the same
// two-phase layout the substitution pass uses.

use crate::{
    game::GameContext,
    parse::tag_jump_targets,
    statement_size,
    system::{resolve_syscall, resolve_sysvar, QnamePart},
    BinaryOp, MesExpression, MesParameter, MesStatement, MesStatementKind, MesText, StmtOp,
};
use anyhow::{anyhow, bail, ensure, Result};
use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq)]
enum Tok {
    Ident(String),
    Number(u32),
    Str(String),
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Semi,
    Colon,
    Comma,
    Dot,
    Assign,
    Arrow,
    Op(BinaryOp),
    Eof,
}

fn lex(input: &str) -> Result<Vec<Tok>> {
    let mut toks = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0usize;
    let mut line = 1usize;
    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b'\n' => {
                line += 1;
                i += 1;
            }
            b' ' | b'\t' | b'\r' => i += 1,
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'{' => {
                toks.push(Tok::LBrace);
                i += 1;
            }
            b'}' => {
                toks.push(Tok::RBrace);
                i += 1;
            }
            b'[' => {
                toks.push(Tok::LBracket);
                i += 1;
            }
            b']' => {
                toks.push(Tok::RBracket);
                i += 1;
            }
            b'(' => {
                toks.push(Tok::LParen);
                i += 1;
            }
            b')' => {
                toks.push(Tok::RParen);
                i += 1;
            }
            b';' => {
                toks.push(Tok::Semi);
                i += 1;
            }
            b':' => {
                toks.push(Tok::Colon);
                i += 1;
            }
            b',' => {
                toks.push(Tok::Comma);
                i += 1;
            }
            b'.' => {
                toks.push(Tok::Dot);
                i += 1;
            }
            b'=' if bytes.get(i + 1) == Some(&b'=') => {
                toks.push(Tok::Op(BinaryOp::Eq));
                i += 2;
            }
            b'=' => {
                toks.push(Tok::Assign);
                i += 1;
            }
            b'!' if bytes.get(i + 1) == Some(&b'=') => {
                toks.push(Tok::Op(BinaryOp::Neq));
                i += 2;
            }
            b'<' if bytes.get(i + 1) == Some(&b'=') => {
                toks.push(Tok::Op(BinaryOp::Lte));
                i += 2;
            }
            b'<' => {
                toks.push(Tok::Op(BinaryOp::Lt));
                i += 1;
            }
            b'>' if bytes.get(i + 1) == Some(&b'=') => {
                toks.push(Tok::Op(BinaryOp::Gte));
                i += 2;
            }
            b'>' => {
                toks.push(Tok::Op(BinaryOp::Gt));
                i += 1;
            }
            b'&' if bytes.get(i + 1) == Some(&b'&') => {
                toks.push(Tok::Op(BinaryOp::LogAnd));
                i += 2;
            }
            b'&' => {
                toks.push(Tok::Op(BinaryOp::BitAnd));
                i += 1;
            }
            b'|' if bytes.get(i + 1) == Some(&b'|') => {
                toks.push(Tok::Op(BinaryOp::LogOr));
                i += 2;
            }
            b'|' => {
                toks.push(Tok::Op(BinaryOp::BitIor));
                i += 1;
            }
            b'^' => {
                toks.push(Tok::Op(BinaryOp::BitXor));
                i += 1;
            }
            b'+' => {
                toks.push(Tok::Op(BinaryOp::Add));
                i += 1;
            }
            b'-' if bytes.get(i + 1) == Some(&b'>') => {
                toks.push(Tok::Arrow);
                i += 2;
            }
            b'-' => {
                toks.push(Tok::Op(BinaryOp::Sub));
                i += 1;
            }
            b'*' => {
                toks.push(Tok::Op(BinaryOp::Mul));
                i += 1;
            }
            b'/' => {
                toks.push(Tok::Op(BinaryOp::Div));
                i += 1;
            }
            b'%' => {
                toks.push(Tok::Op(BinaryOp::Mod));
                i += 1;
            }
            b'"' => {
                let start = i + 1;
                let mut j = start;
                loop {
                    match bytes.get(j) {
                        None => bail!("line {}: unterminated string literal", line),
                        Some(b'"') => break,
                        Some(b'\\') => j += 2,
                        Some(_) => j += input[j..].chars().next().unwrap().len_utf8(),
                    }
                }
                toks.push(Tok::Str(input[start..j].to_string()));
                i = j + 1;
            }
            b'0' if bytes.get(i + 1) == Some(&b'x') || bytes.get(i + 1) == Some(&b'X') => {
                let start = i + 2;
                let mut j = start;
                while j < bytes.len() && bytes[j].is_ascii_hexdigit() {
                    j += 1;
                }
                ensure!(j > start, "line {}: bad hex literal", line);
                let v = u32::from_str_radix(&input[start..j], 16)?;
                toks.push(Tok::Number(v));
                i = j;
            }
            b'0'..=b'9' => {
                let start = i;
                let mut j = i;
                while j < bytes.len() && bytes[j].is_ascii_digit() {
                    j += 1;
                }
                toks.push(Tok::Number(input[start..j].parse()?));
                i = j;
            }
            c if c == b'_' || c.is_ascii_alphabetic() => {
                let start = i;
                let mut j = i;
                while j < bytes.len()
                    && (bytes[j] == b'_' || bytes[j].is_ascii_alphanumeric())
                {
                    j += 1;
                }
                toks.push(Tok::Ident(input[start..j].to_string()));
                i = j;
            }
            other => bail!("line {}: unexpected character: {:?}", line, other as char),
        }
    }
    toks.push(Tok::Eof);
    Ok(toks)
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
enum Label {
    Named(String),
    Gen(usize),
}

struct Parser<'a> {
    ctx: &'a GameContext,
    toks: Vec<Tok>,
    pos: usize,
    stmts: Vec<MesStatement>,
    /// Label -> index of the statement it precedes (may equal stmts.len()).
    labels: HashMap<Label, usize>,
    next_gen: usize,
    /// Statement index -> unresolved label of its address operand.
    refs: Vec<(usize, Label)>,
    /// (head, break target) of each enclosing while.
    loops: Vec<(Label, Label)>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Tok {
        &self.toks[self.pos]
    }

    fn peek2(&self) -> &Tok {
        self.toks.get(self.pos + 1).unwrap_or(&Tok::Eof)
    }

    fn next(&mut self) -> Tok {
        let t = self.toks[self.pos].clone();
        if self.pos + 1 < self.toks.len() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, tok: Tok) -> Result<()> {
        let t = self.next();
        ensure!(t == tok, "expected {:?}, got {:?}", tok, t);
        Ok(())
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.next() {
            Tok::Ident(s) => Ok(s),
            t => bail!("expected identifier, got {:?}", t),
        }
    }

    fn expect_number(&mut self) -> Result<u32> {
        match self.next() {
            Tok::Number(n) => Ok(n),
            t => bail!("expected number, got {:?}", t),
        }
    }

    fn eat_ident(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Tok::Ident(s) if s == word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn emit(&mut self, kind: MesStatementKind) -> usize {
        self.stmts.push(MesStatement::new(kind));
        self.stmts.len() - 1
    }

    fn emit_ref(&mut self, kind: MesStatementKind, label: Label) {
        let idx = self.emit(kind);
        self.refs.push((idx, label));
    }

    fn gen_label(&mut self) -> Label {
        self.next_gen += 1;
        Label::Gen(self.next_gen - 1)
    }

    fn define_label(&mut self, label: Label) -> Result<()> {
        let here = self.stmts.len();
        ensure!(
            self.labels.insert(label.clone(), here).is_none(),
            "multiple definitions of label {:?}",
            label
        );
        Ok(())
    }

    // expressions

    fn parse_expression(&mut self) -> Result<MesExpression> {
        self.parse_binary(0)
    }

    // Precedence climbing over five levels, lowest first: || and &&,
    // bitwise, comparisons, additive, multiplicative.
    fn parse_binary(&mut self, level: usize) -> Result<MesExpression> {
        const LEVELS: [&[BinaryOp]; 5] = [
            &[BinaryOp::LogOr, BinaryOp::LogAnd],
            &[BinaryOp::BitAnd, BinaryOp::BitIor, BinaryOp::BitXor],
            &[
                BinaryOp::Lt,
                BinaryOp::Gt,
                BinaryOp::Lte,
                BinaryOp::Gte,
                BinaryOp::Eq,
                BinaryOp::Neq,
            ],
            &[BinaryOp::Add, BinaryOp::Sub],
            &[BinaryOp::Mul, BinaryOp::Div, BinaryOp::Mod],
        ];
        if level >= LEVELS.len() {
            return self.parse_primary();
        }
        let mut lhs = self.parse_binary(level + 1)?;
        loop {
            let op = match self.peek() {
                Tok::Op(op) if LEVELS[level].contains(op) => *op,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_binary(level + 1)?;
            lhs = MesExpression::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_index_u8(&mut self) -> Result<u8> {
        self.expect(Tok::LBracket)?;
        let n = self.expect_number()?;
        self.expect(Tok::RBracket)?;
        ensure!(n <= 0xff, "variable index out of range: {}", n);
        Ok(n as u8)
    }

    fn parse_bracketed_expression(&mut self) -> Result<MesExpression> {
        self.expect(Tok::LBracket)?;
        let e = self.parse_expression()?;
        self.expect(Tok::RBracket)?;
        Ok(e)
    }

    // `->byte[e]` / `->word[e]` / `->dword[e]`
    fn parse_member(&mut self) -> Result<(String, MesExpression)> {
        self.expect(Tok::Arrow)?;
        let member = self.expect_ident()?;
        let index = self.parse_bracketed_expression()?;
        Ok((member, index))
    }

    fn parse_primary(&mut self) -> Result<MesExpression> {
        match self.next() {
            Tok::Number(n) => Ok(MesExpression::imm(n)),
            Tok::LParen => {
                let e = self.parse_expression()?;
                self.expect(Tok::RParen)?;
                Ok(e)
            }
            Tok::Ident(word) => match word.as_str() {
                "rand" => {
                    self.expect(Tok::LParen)?;
                    let e = self.parse_expression()?;
                    self.expect(Tok::RParen)?;
                    Ok(MesExpression::Rand(Box::new(e)))
                }
                "var4" => {
                    let index = self.parse_bracketed_expression()?;
                    match index.imm_value() {
                        Some(v) if v <= 0xffff => Ok(MesExpression::GetFlagConst(v as u16)),
                        _ => Ok(MesExpression::GetFlagExpr(Box::new(index))),
                    }
                }
                "var16" => {
                    let var_no = self.parse_index_u8()?;
                    if *self.peek() != Tok::Arrow {
                        return Ok(MesExpression::GetVar16(var_no));
                    }
                    let (member, index) = self.parse_member()?;
                    match member.as_str() {
                        "byte" => Ok(MesExpression::Ptr16Get8 {
                            var_no,
                            index: Box::new(index),
                        }),
                        "word" => Ok(MesExpression::Ptr16Get16 {
                            var_no: var_no + 1,
                            index: Box::new(index),
                        }),
                        _ => bail!("invalid var16 member: {}", member),
                    }
                }
                "var32" => {
                    let var_no = self.parse_index_u8()?;
                    if *self.peek() != Tok::Arrow {
                        return Ok(MesExpression::GetVar32(var_no));
                    }
                    let (member, index) = self.parse_member()?;
                    let index = Box::new(index);
                    match member.as_str() {
                        "byte" => Ok(MesExpression::Ptr32Get8 {
                            var_no: var_no + 1,
                            index,
                        }),
                        "word" => Ok(MesExpression::Ptr32Get16 {
                            var_no: var_no + 1,
                            index,
                        }),
                        "dword" => Ok(MesExpression::Ptr32Get32 {
                            var_no: var_no + 1,
                            index,
                        }),
                        _ => bail!("invalid var32 member: {}", member),
                    }
                }
                "System" => {
                    self.expect(Tok::Dot)?;
                    let name = self.expect_ident()?;
                    match name.as_str() {
                        "var16" => Ok(MesExpression::Ptr16Get16 {
                            var_no: 0,
                            index: Box::new(self.parse_bracketed_expression()?),
                        }),
                        "var32" => Ok(MesExpression::Ptr32Get32 {
                            var_no: 0,
                            index: Box::new(self.parse_bracketed_expression()?),
                        }),
                        name => {
                            let (no, dword) = resolve_sysvar(name)
                                .ok_or_else(|| anyhow!("invalid system variable: {}", name))?;
                            let index = Box::new(MesExpression::Imm8(no));
                            if dword {
                                Ok(MesExpression::Ptr32Get32 { var_no: 0, index })
                            } else {
                                Ok(MesExpression::Ptr16Get16 { var_no: 0, index })
                            }
                        }
                    }
                }
                other => bail!("unexpected identifier in expression: {}", other),
            },
            t => bail!("unexpected token in expression: {:?}", t),
        }
    }

    // statement helpers

    fn parse_expression_list(&mut self) -> Result<Vec<MesExpression>> {
        let mut vals = vec![self.parse_expression()?];
        while *self.peek() == Tok::Comma {
            self.pos += 1;
            vals.push(self.parse_expression()?);
        }
        Ok(vals)
    }

    fn parse_assignment_vals(&mut self) -> Result<Vec<MesExpression>> {
        self.expect(Tok::Assign)?;
        let vals = self.parse_expression_list()?;
        self.expect(Tok::Semi)?;
        Ok(vals)
    }

    fn parse_parameter_list(&mut self) -> Result<Vec<MesParameter>> {
        self.expect(Tok::LParen)?;
        let mut params = Vec::new();
        if *self.peek() == Tok::RParen {
            self.pos += 1;
            return Ok(params);
        }
        loop {
            if let Tok::Str(s) = self.peek() {
                params.push(MesParameter::Str(s.clone()));
                self.pos += 1;
            } else {
                params.push(MesParameter::Expr(self.parse_expression()?));
            }
            match self.next() {
                Tok::Comma => continue,
                Tok::RParen => return Ok(params),
                t => bail!("expected ',' or ')' in parameter list, got {:?}", t),
            }
        }
    }

    fn parse_label_ref(&mut self) -> Result<Label> {
        Ok(Label::Named(self.expect_ident()?))
    }

    // blocks & items

    fn parse_block(&mut self) -> Result<()> {
        self.expect(Tok::LBrace)?;
        while *self.peek() != Tok::RBrace {
            ensure!(*self.peek() != Tok::Eof, "unexpected end of file in block");
            self.parse_item()?;
        }
        self.pos += 1;
        Ok(())
    }

    fn parse_if(&mut self) -> Result<()> {
        self.expect(Tok::LParen)?;
        let cond = self.parse_expression()?;
        self.expect(Tok::RParen)?;
        let l_false = self.gen_label();
        self.emit_ref(MesStatementKind::Jz { cond, addr: 0 }, l_false.clone());
        self.parse_block()?;
        if self.eat_ident("else") {
            let l_end = self.gen_label();
            self.emit_ref(MesStatementKind::Jmp { addr: 0 }, l_end.clone());
            self.define_label(l_false)?;
            if self.eat_ident("if") {
                self.parse_if()?;
            } else {
                self.parse_block()?;
            }
            self.define_label(l_end)?;
        } else {
            self.define_label(l_false)?;
        }
        Ok(())
    }

    fn parse_while(&mut self) -> Result<()> {
        self.expect(Tok::LParen)?;
        let cond = self.parse_expression()?;
        self.expect(Tok::RParen)?;
        let l_head = self.gen_label();
        let l_end = self.gen_label();
        self.define_label(l_head.clone())?;
        self.emit_ref(MesStatementKind::Jz { cond, addr: 0 }, l_end.clone());
        self.loops.push((l_head.clone(), l_end.clone()));
        self.parse_block()?;
        self.loops.pop();
        self.emit_ref(MesStatementKind::Jmp { addr: 0 }, l_head);
        self.define_label(l_end)?;
        Ok(())
    }

    fn parse_procedure(&mut self) -> Result<()> {
        self.expect(Tok::LBracket)?;
        let no_expr = self.parse_expression()?;
        self.expect(Tok::RBracket)?;
        self.expect(Tok::Assign)?;
        let l_skip = self.gen_label();
        self.emit_ref(
            MesStatementKind::DefProc {
                no_expr,
                skip_addr: 0,
            },
            l_skip.clone(),
        );
        self.parse_block()?;
        self.expect(Tok::Semi)?;
        self.emit(MesStatementKind::End);
        self.define_label(l_skip)?;
        Ok(())
    }

    fn parse_menu(&mut self) -> Result<()> {
        self.expect(Tok::LBracket)?;
        let params = self.parse_parameter_list()?;
        self.expect(Tok::RBracket)?;
        self.expect(Tok::Assign)?;
        let l_skip = self.gen_label();
        self.emit_ref(
            MesStatementKind::DefMenu {
                params,
                skip_addr: 0,
            },
            l_skip.clone(),
        );
        self.parse_block()?;
        self.expect(Tok::Semi)?;
        self.emit(MesStatementKind::End);
        self.define_label(l_skip)?;
        Ok(())
    }

    fn parse_system_statement(&mut self) -> Result<()> {
        self.expect(Tok::Dot)?;
        // System.var16[e] / System.var32[e] / System.name assignments, or a
        // qualified syscall.
        if self.eat_ident("var16") {
            let off = self.parse_bracketed_expression()?;
            let vals = self.parse_assignment_vals()?;
            self.emit(MesStatementKind::Ptr16Set16 {
                var_no: 0,
                off,
                vals,
            });
            return Ok(());
        }
        if self.eat_ident("var32") {
            let off = self.parse_bracketed_expression()?;
            let vals = self.parse_assignment_vals()?;
            self.emit(MesStatementKind::Ptr32Set32 {
                var_no: 0,
                off,
                vals,
            });
            return Ok(());
        }

        let mut parts = Vec::new();
        loop {
            if self.eat_ident("function") {
                self.expect(Tok::LBracket)?;
                // A non-immediate selector can only be the whole call.
                if parts.is_empty() && !matches!(self.peek(), Tok::Number(_)) {
                    let expr = self.parse_expression()?;
                    self.expect(Tok::RBracket)?;
                    let params = self.parse_parameter_list()?;
                    self.expect(Tok::Semi)?;
                    self.emit(MesStatementKind::Sys { expr, params });
                    return Ok(());
                }
                let no = self.expect_number()?;
                self.expect(Tok::RBracket)?;
                parts.push(QnamePart::Number(no));
            } else {
                let name = self.expect_ident()?;
                if parts.is_empty() && *self.peek() == Tok::Assign {
                    // Named system variable write.
                    let (no, dword) = resolve_sysvar(&name)
                        .ok_or_else(|| anyhow!("invalid system variable: {}", name))?;
                    self.pos += 1;
                    let vals = self.parse_expression_list()?;
                    self.expect(Tok::Semi)?;
                    let off = MesExpression::Imm8(no);
                    if dword {
                        self.emit(MesStatementKind::Ptr32Set32 {
                            var_no: 0,
                            off,
                            vals,
                        });
                    } else {
                        self.emit(MesStatementKind::Ptr16Set16 {
                            var_no: 0,
                            off,
                            vals,
                        });
                    }
                    return Ok(());
                }
                parts.push(QnamePart::Ident(name));
            }
            if *self.peek() == Tok::Dot {
                self.pos += 1;
                continue;
            }
            break;
        }
        let (no, mut params) = resolve_syscall(&parts)?;
        params.extend(self.parse_parameter_list()?);
        self.expect(Tok::Semi)?;
        self.emit(MesStatementKind::Sys {
            expr: MesExpression::imm(u32::from(no)),
            params,
        });
        Ok(())
    }

    fn parse_text_statement(&mut self, unprefixed: bool, unterminated: bool) -> Result<()> {
        let raw = match self.next() {
            Tok::Str(s) => s,
            t => bail!("expected string literal, got {:?}", t),
        };
        self.expect(Tok::Semi)?;
        let kinds = split_text_literal(&raw)?;
        ensure!(
            !(unprefixed || unterminated) || kinds.len() == 1,
            "flagged string must be a single homogeneous run: {:?}",
            raw
        );
        for mut kind in kinds {
            if let MesStatementKind::Txt(t) | MesStatementKind::Str(t) = &mut kind {
                t.unprefixed = unprefixed;
                t.terminated = !unterminated;
            }
            self.emit(kind);
        }
        Ok(())
    }

    fn parse_var_statement(&mut self, family: &str) -> Result<()> {
        match family {
            "var4" => {
                let index = self.parse_bracketed_expression()?;
                let vals = self.parse_assignment_vals()?;
                match index.imm_value() {
                    Some(v) if v <= 0xffff => {
                        self.emit(MesStatementKind::SetFlagConst {
                            var_no: v as u16,
                            vals,
                        });
                    }
                    _ => {
                        self.emit(MesStatementKind::SetFlagExpr {
                            var_expr: index,
                            vals,
                        });
                    }
                }
            }
            "var16" => {
                let var_no = self.parse_index_u8()?;
                if *self.peek() == Tok::Arrow {
                    let (member, off) = self.parse_member()?;
                    let vals = self.parse_assignment_vals()?;
                    match member.as_str() {
                        "byte" => {
                            self.emit(MesStatementKind::Ptr16Set8 { var_no, off, vals });
                        }
                        "word" => {
                            self.emit(MesStatementKind::Ptr16Set16 {
                                var_no: var_no + 1,
                                off,
                                vals,
                            });
                        }
                        _ => bail!("invalid var16 member: {}", member),
                    }
                } else {
                    let vals = self.parse_assignment_vals()?;
                    self.emit(MesStatementKind::SetVar16 { var_no, vals });
                }
            }
            "var32" => {
                let var_no = self.parse_index_u8()?;
                if *self.peek() == Tok::Arrow {
                    let (member, off) = self.parse_member()?;
                    let vals = self.parse_assignment_vals()?;
                    match member.as_str() {
                        "byte" => {
                            self.emit(MesStatementKind::Ptr32Set8 { var_no, off, vals });
                        }
                        "word" => {
                            self.emit(MesStatementKind::Ptr32Set16 { var_no, off, vals });
                        }
                        "dword" => {
                            self.emit(MesStatementKind::Ptr32Set32 {
                                var_no: var_no + 1,
                                off,
                                vals,
                            });
                        }
                        _ => bail!("invalid var32 member: {}", member),
                    }
                } else {
                    let vals = self.parse_assignment_vals()?;
                    self.emit(MesStatementKind::SetVar32 { var_no, vals });
                }
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    fn parse_item(&mut self) -> Result<()> {
        if let Tok::Str(_) = self.peek() {
            return self.parse_text_statement(false, false);
        }
        let word = match self.peek() {
            Tok::Ident(word) => word.clone(),
            t => bail!("unexpected token at statement start: {:?}", t),
        };
        // Any identifier followed by a colon is a label.
        if *self.peek2() == Tok::Colon {
            self.pos += 2;
            return self.define_label(Label::Named(word));
        }
        self.pos += 1;
        match word.as_str() {
            "return" | "END" => {
                self.expect(Tok::Semi)?;
                self.emit(MesStatementKind::End);
            }
            "if" => self.parse_if()?,
            "while" => self.parse_while()?,
            "break" => {
                self.expect(Tok::Semi)?;
                let (_, l_end) = self
                    .loops
                    .last()
                    .cloned()
                    .ok_or_else(|| anyhow!("break outside of loop"))?;
                self.emit_ref(MesStatementKind::Jmp { addr: 0 }, l_end);
            }
            "continue" => {
                self.expect(Tok::Semi)?;
                let (l_head, _) = self
                    .loops
                    .last()
                    .cloned()
                    .ok_or_else(|| anyhow!("continue outside of loop"))?;
                self.emit_ref(MesStatementKind::Jmp { addr: 0 }, l_head);
            }
            "goto" => {
                let label = self.parse_label_ref()?;
                self.expect(Tok::Semi)?;
                self.emit_ref(MesStatementKind::Jmp { addr: 0 }, label);
            }
            "jz" => {
                let cond = self.parse_expression()?;
                let label = self.parse_label_ref()?;
                self.expect(Tok::Semi)?;
                self.emit_ref(MesStatementKind::Jz { cond, addr: 0 }, label);
            }
            "procedure" => self.parse_procedure()?,
            "menu" => self.parse_menu()?,
            "defproc" => {
                let no_expr = self.parse_expression()?;
                let label = self.parse_label_ref()?;
                self.expect(Tok::Semi)?;
                self.emit_ref(
                    MesStatementKind::DefProc {
                        no_expr,
                        skip_addr: 0,
                    },
                    label,
                );
            }
            "defmenu" => {
                let params = self.parse_parameter_list()?;
                let label = self.parse_label_ref()?;
                self.expect(Tok::Semi)?;
                self.emit_ref(
                    MesStatementKind::DefMenu {
                        params,
                        skip_addr: 0,
                    },
                    label,
                );
            }
            "jump" => {
                let params = self.parse_parameter_list()?;
                self.expect(Tok::Semi)?;
                self.emit(MesStatementKind::JmpMes(params));
            }
            "call" => {
                let params = self.parse_parameter_list()?;
                self.expect(Tok::Semi)?;
                ensure!(!params.is_empty(), "call with zero parameters");
                // A string target names another .mes file, a numeric one a
                // local procedure.
                if matches!(params[0], MesParameter::Str(_)) {
                    self.emit(MesStatementKind::CallMes(params));
                } else {
                    self.emit(MesStatementKind::CallProc(params));
                }
            }
            "util" => {
                let params = self.parse_parameter_list()?;
                self.expect(Tok::Semi)?;
                self.emit(MesStatementKind::Util(params));
            }
            "line" => {
                let arg = self.expect_number()?;
                self.expect(Tok::Semi)?;
                ensure!(arg <= 0xff, "line argument out of range");
                self.emit(MesStatementKind::Line(arg as u8));
            }
            "menuexec" => {
                let params = if *self.peek() == Tok::LParen {
                    self.parse_parameter_list()?
                } else {
                    Vec::new()
                };
                self.expect(Tok::Semi)?;
                self.emit(MesStatementKind::MenuExec(params));
            }
            "unprefixed" => {
                let unterminated = self.eat_ident("unterminated");
                self.parse_text_statement(true, unterminated)?;
            }
            "unterminated" => {
                self.parse_text_statement(false, true)?;
            }
            "System" => self.parse_system_statement()?,
            "var4" | "var16" | "var32" => self.parse_var_statement(&word)?,
            other => bail!("unknown statement: {}", other),
        }
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<MesStatement>> {
        let dangling_label = self.labels.values().any(|&idx| idx == self.stmts.len());
        let last_is_end = self
            .stmts
            .last()
            .map(|s| s.kind.op() == StmtOp::End)
            .unwrap_or(false);
        // The printer elides the file's trailing return, so restore it.
        if !last_is_end || dangling_label {
            self.emit(MesStatementKind::End);
        }

        let mut addr = 0u32;
        for stmt in &mut self.stmts {
            stmt.address = addr;
            addr += statement_size(self.ctx, stmt);
            stmt.next_address = addr;
        }

        for (idx, label) in &self.refs {
            let target = match self.labels.get(label) {
                Some(&target) => target,
                None => match label {
                    Label::Named(name) => bail!("undefined label: {}", name),
                    Label::Gen(_) => bail!("internal label left undefined"),
                },
            };
            ensure!(target < self.stmts.len(), "label points past end of file");
            let target_addr = self.stmts[target].address;
            *self.stmts[*idx]
                .kind
                .target_addr_mut()
                .expect("label reference on statement without address operand") = target_addr;
        }

        tag_jump_targets(&mut self.stmts)?;
        Ok(self.stmts)
    }
}

// Split a string literal into homogeneous text statements: hankaku and
// zenkaku runs alternate as the characters demand, and $n (or $(n))
// becomes the procedure call the printer folded in.
fn split_text_literal(raw: &str) -> Result<Vec<MesStatementKind>> {
    let mut out = Vec::new();
    let bytes = raw.as_bytes();
    let mut run_start = 0usize;
    let mut run_zenkaku = false;
    let mut i = 0usize;

    let push_run = |out: &mut Vec<MesStatementKind>, text: &str, zenkaku: bool| {
        let t = MesText::new(text);
        if zenkaku {
            out.push(MesStatementKind::Txt(t));
        } else {
            out.push(MesStatementKind::Str(t));
        }
    };

    while i < bytes.len() {
        if bytes[i] == b'$'
            && bytes
                .get(i + 1)
                .map_or(false, |c| c.is_ascii_digit() || *c == b'(')
        {
            let (no, consumed) = if bytes[i + 1] == b'(' {
                let close = raw[i + 2..]
                    .find(')')
                    .ok_or_else(|| anyhow!("invalid '$' call in string: {:?}", raw))?;
                (raw[i + 2..i + 2 + close].trim().parse::<u32>()?, close + 3)
            } else {
                let digits: String = raw[i + 1..]
                    .chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect();
                (digits.parse::<u32>()?, digits.len() + 1)
            };
            if i > run_start {
                push_run(&mut out, &raw[run_start..i], run_zenkaku);
            }
            out.push(MesStatementKind::CallProc(vec![MesParameter::Expr(
                MesExpression::imm(no),
            )]));
            i += consumed;
            run_start = i;
            continue;
        }
        let (next_zenkaku, advance) = if bytes[i] == b'\\' {
            match bytes.get(i + 1) {
                Some(b'X') => (true, 6),
                Some(b'x') => (false, 4),
                Some(b'n') | Some(b't') | Some(b'$') | Some(b'\\') | Some(b'"') => (false, 2),
                _ => bail!("invalid escape in string: {:?}", raw),
            }
        } else {
            let ch = raw[i..].chars().next().unwrap();
            (sjis::char_width(ch)? == 2, ch.len_utf8())
        };
        if i > run_start && run_zenkaku != next_zenkaku {
            push_run(&mut out, &raw[run_start..i], run_zenkaku);
            run_start = i;
        }
        run_zenkaku = next_zenkaku;
        i += advance;
    }
    if i > run_start {
        push_run(&mut out, &raw[run_start..i], run_zenkaku);
    }
    Ok(out)
}

/// Parse .smes text (structured or flat) into an address-assigned,
/// jump-tagged statement list ready for the assembler.
pub fn parse_smes(ctx: &GameContext, input: &str) -> Result<Vec<MesStatement>> {
    let mut parser = Parser {
        ctx,
        toks: lex(input)?,
        pos: 0,
        stmts: Vec::new(),
        labels: HashMap::new(),
        next_gen: 0,
        refs: Vec::new(),
        loops: Vec::new(),
    };
    while *parser.peek() != Tok::Eof {
        parser.parse_item()?;
    }
    parser.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{pack_statements, Game};

    fn ctx() -> &'static GameContext {
        GameContext::for_game(Game::ElfClassics)
    }

    #[test]
    fn empty_input_compiles_to_end() -> Result<()> {
        let stmts = parse_smes(ctx(), "")?;
        assert_eq!(pack_statements(ctx(), &stmts)?, vec![0x00]);
        Ok(())
    }

    #[test]
    fn compiles_conditional_to_expected_bytes() -> Result<()> {
        let text = "if (var16[0] == 1) {\n\tvar16[1] = 2;\n} else {\n\tvar16[1] = 3;\n}\n";
        let stmts = parse_smes(ctx(), text)?;
        let packed = pack_statements(ctx(), &stmts)?;
        // JZ to the else arm, then JMP over it, then END appended.
        assert_eq!(
            packed,
            vec![
                0x0b, 0x80, 0x00, 0x01, 0xef, 0xff, 0x14, 0x00, 0x00, 0x00, // JZ -> 20
                0x04, 0x01, 0x02, 0xff, 0x00, // var16[1] = 2
                0x0c, 0x19, 0x00, 0x00, 0x00, // JMP -> 25
                0x04, 0x01, 0x03, 0xff, 0x00, // var16[1] = 3
                0x00, // END
            ]
        );
        Ok(())
    }

    #[test]
    fn compiles_while_with_break_and_continue() -> Result<()> {
        let text = "var16[0] = 0;\nwhile (var4[0]) {\n\tif (var4[1]) {\n\t\tbreak;\n\t}\n\tcontinue;\n}\n";
        let stmts = parse_smes(ctx(), text)?;
        // Statement shapes: SETV, JZ(end), JZ(no-break), JMP(break->end),
        // JMP(continue->head), JMP(loop->head), END.
        let ops: Vec<StmtOp> = stmts.iter().map(|s| s.kind.op()).collect();
        assert_eq!(
            ops,
            vec![
                StmtOp::SetVar16,
                StmtOp::Jz,
                StmtOp::Jz,
                StmtOp::Jmp,
                StmtOp::Jmp,
                StmtOp::Jmp,
                StmtOp::End
            ]
        );
        let head = stmts[1].address;
        let end = stmts[6].address;
        assert_eq!(stmts[1].kind.target_addr(), Some(end));
        assert_eq!(stmts[3].kind.target_addr(), Some(end));
        assert_eq!(stmts[4].kind.target_addr(), Some(head));
        assert_eq!(stmts[5].kind.target_addr(), Some(head));
        assert!(stmts[1].is_jump_target);
        Ok(())
    }

    #[test]
    fn compiles_procedure_with_skip() -> Result<()> {
        let stmts = parse_smes(ctx(), "procedure[1] = {\n\tline 0;\n};\n")?;
        // DefProc, Line, End (procedure), End (file).
        let ops: Vec<StmtOp> = stmts.iter().map(|s| s.kind.op()).collect();
        assert_eq!(
            ops,
            vec![StmtOp::DefProc, StmtOp::Line, StmtOp::End, StmtOp::End]
        );
        // skip_addr points just past the procedure's END.
        assert_eq!(stmts[0].kind.target_addr(), Some(stmts[3].address));
        assert_eq!(stmts[2].address + 1, stmts[3].address);
        Ok(())
    }

    #[test]
    fn compiles_labels_and_goto() -> Result<()> {
        let stmts = parse_smes(ctx(), "L_00000000:\nline 1;\ngoto L_00000000;\n")?;
        assert_eq!(stmts[1].kind.target_addr(), Some(0));
        assert!(stmts[0].is_jump_target);
        Ok(())
    }

    #[test]
    fn compiles_syscalls_and_sysvars() -> Result<()> {
        let text = "System.width = 640;\nSystem.Cursor.load(\"CURSOR1.CUR\");\nSystem.function[6]();\n";
        let stmts = parse_smes(ctx(), text)?;
        match &stmts[0].kind {
            MesStatementKind::Ptr16Set16 { var_no, off, .. } => {
                assert_eq!(*var_no, 0);
                assert_eq!(*off, MesExpression::Imm8(7));
            }
            other => panic!("unexpected statement: {:?}", other),
        }
        match &stmts[1].kind {
            MesStatementKind::Sys { expr, params } => {
                assert_eq!(*expr, MesExpression::Imm8(2));
                assert_eq!(params.len(), 2);
                assert_eq!(params[0], MesParameter::Expr(MesExpression::Imm8(0)));
                assert_eq!(params[1], MesParameter::Str("CURSOR1.CUR".into()));
            }
            other => panic!("unexpected statement: {:?}", other),
        }
        match &stmts[2].kind {
            MesStatementKind::Sys { expr, params } => {
                assert_eq!(*expr, MesExpression::Imm8(6));
                assert!(params.is_empty());
            }
            other => panic!("unexpected statement: {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn splits_string_statements() -> Result<()> {
        let stmts = parse_smes(ctx(), "\"ABあい$3う\";\n")?;
        let ops: Vec<StmtOp> = stmts.iter().map(|s| s.kind.op()).collect();
        assert_eq!(
            ops,
            vec![
                StmtOp::Str,
                StmtOp::Txt,
                StmtOp::CallProc,
                StmtOp::Txt,
                StmtOp::End
            ]
        );
        Ok(())
    }

    #[test]
    fn pointer_write_conventions_match_printer() -> Result<()> {
        // The printer offsets var16 word pointers by one; compiling its
        // output must restore the on-disk numbering.
        let stmts = parse_smes(ctx(), "var16[2]->word[0] = 1;\nvar16[2]->byte[0] = 1;\n")?;
        match &stmts[0].kind {
            MesStatementKind::Ptr16Set16 { var_no, .. } => assert_eq!(*var_no, 3),
            other => panic!("unexpected statement: {:?}", other),
        }
        match &stmts[1].kind {
            MesStatementKind::Ptr16Set8 { var_no, .. } => assert_eq!(*var_no, 2),
            other => panic!("unexpected statement: {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn unprefixed_text_round_trips() -> Result<()> {
        let stmts = parse_smes(ctx(), "unprefixed \"AB\";\n")?;
        match &stmts[0].kind {
            MesStatementKind::Str(t) => {
                assert!(t.unprefixed);
                assert!(t.terminated);
            }
            other => panic!("unexpected statement: {:?}", other),
        }
        assert_eq!(pack_statements(ctx(), &stmts)?, b"AB\0\0");
        Ok(())
    }
}
