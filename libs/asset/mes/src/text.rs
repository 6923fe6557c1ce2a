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

// Text substitution: replace the N-th text run of a file with new lines,
// keeping every jump in the file byte-accurate. Substituted statements are
// re-encoded and every address is recomputed through the size calculator,
// then all Jz/Jmp/DefMenu/DefProc operands are rewritten through a table
// keyed by the original addresses. This is the whole reason sizing is
// separate from assembly.

use crate::{
    game::{GameContext, Variant},
    statement_size, MesExpression, MesParameter, MesStatement, MesStatementKind, MesText,
};
use anyhow::{bail, ensure, Result};
use log::warn;
use std::collections::HashMap;
use std::fmt::Write;

/// One replacement line plus its display width in engine columns.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MesTextLine {
    pub text: String,
    pub columns: u32,
}

/// A substitution for one text position: `no` counts text runs in file
/// order, `from` is the original text (kept for reference and as the
/// fallback), `to` is the replacement.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MesTextSub {
    pub no: usize,
    pub from: String,
    pub to: Vec<MesTextLine>,
    pub columns: u32,
}

pub type MesTextSubList = Vec<MesTextSub>;

// Display width of escaped text: hankaku cells count 1, zenkaku cells 2.
fn text_columns(text: &str) -> Result<u32> {
    let mut cols = 0u32;
    let s = text.as_bytes();
    let mut i = 0usize;
    while i < s.len() {
        if s[i] == b'\\' {
            match s.get(i + 1) {
                Some(b'n') | Some(b't') | Some(b'$') | Some(b'\\') | Some(b'"') => {
                    cols += 1;
                    i += 2;
                }
                Some(b'x') => {
                    cols += 1;
                    i += 4;
                }
                Some(b'X') => {
                    cols += 2;
                    i += 6;
                }
                _ => bail!("invalid escape in string: {:?}", text),
            }
        } else {
            let ch = text[i..].chars().next().unwrap();
            cols += sjis::char_width(ch)? as u32;
            i += ch.len_utf8();
        }
    }
    Ok(cols)
}

fn parse_quoted(line: &str, lineno: usize) -> Result<(String, &str)> {
    let rest = line.trim_start();
    let Some(rest) = rest.strip_prefix('"') else {
        bail!("at line {}: expected '\"': {:?}", lineno, line);
    };
    let bytes = rest.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => return Ok((rest[..i].to_string(), &rest[i + 1..])),
            b'\\' => match bytes.get(i + 1) {
                Some(b'n') | Some(b't') | Some(b'r') | Some(b'"') | Some(b'$')
                | Some(b'\\') => i += 2,
                Some(b'x') => i += 4,
                Some(b'X') => i += 6,
                _ => bail!("at line {}: invalid string escape", lineno),
            },
            _ => i += rest[i..].chars().next().unwrap().len_utf8(),
        }
    }
    bail!("at line {}: unterminated string", lineno);
}

/// Parse a substitution file. `#` opens a header: either a config directive
/// (`#columns = N`) or a substitution opener (`#N "old-text"`). The body is
/// every following line up to the first blank line; `##` lines are
/// comments.
pub fn parse_text_subs(input: &str) -> Result<MesTextSubList> {
    let lines: Vec<&str> = input.lines().collect();
    let mut subs = MesTextSubList::new();
    let mut columns = 0u32;
    let mut i = 0usize;

    while i < lines.len() {
        // Find the next header.
        let mut header: Option<(usize, &str)> = None;
        while i < lines.len() {
            let line = lines[i];
            i += 1;
            if line.is_empty() {
                continue;
            }
            let Some(body) = line.strip_prefix('#') else {
                bail!("at line {}: junk outside substitution: {:?}", i, line);
            };
            if body.starts_with('#') {
                continue; // comment
            }
            let body = body.trim_start();
            if let Some(rest) = body.strip_prefix("columns") {
                let rest = rest.trim_start();
                let Some(value) = rest.strip_prefix('=') else {
                    bail!("at line {}: expected '=' in columns directive", i);
                };
                columns = value.trim().parse()?;
                continue;
            }
            header = Some((i, body));
            break;
        }
        let Some((lineno, header)) = header else {
            break;
        };

        let digits: String = header.chars().take_while(|c| c.is_ascii_digit()).collect();
        ensure!(
            !digits.is_empty(),
            "at line {}: expected substitution number",
            lineno
        );
        let no: usize = digits.parse()?;
        let (from, rest) = parse_quoted(&header[digits.len()..], lineno)?;
        ensure!(
            rest.trim().is_empty(),
            "at line {}: junk at end of header line: {:?}",
            lineno,
            rest
        );

        // Body: lines up to the first blank one.
        let mut to = Vec::new();
        while i < lines.len() {
            let line = lines[i];
            i += 1;
            if line.starts_with("##") {
                continue;
            }
            if line.is_empty() {
                break;
            }
            to.push(MesTextLine {
                text: line.to_string(),
                columns: text_columns(line)?,
            });
        }

        subs.push(MesTextSub {
            no,
            from,
            to,
            columns,
        });
    }
    Ok(subs)
}

fn normal_text(stmt: &MesStatement) -> Option<&MesText> {
    match &stmt.kind {
        MesStatementKind::Txt(t) | MesStatementKind::Str(t)
            if t.terminated && !t.unprefixed =>
        {
            Some(t)
        }
        _ => None,
    }
}

fn call_proc_no(stmt: &MesStatement) -> Option<u32> {
    match &stmt.kind {
        MesStatementKind::CallProc(params) => match params.first() {
            Some(MesParameter::Expr(MesExpression::Imm8(v))) => Some(u32::from(*v)),
            _ => None,
        },
        _ => None,
    }
}

struct TextPos {
    start: usize,
    nr_stmts: usize,
    text: String,
}

// A text position is a maximal run of ordinary text statements, with
// embedded name calls and line breaks swallowed. Runs break at jump
// targets so every address the run hides stays reachable through the
// translation table.
fn text_positions(statements: &[MesStatement]) -> Vec<TextPos> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < statements.len() {
        let Some(t) = normal_text(&statements[i]) else {
            i += 1;
            continue;
        };
        let start = i;
        let mut text = t.text.clone();
        i += 1;
        while i < statements.len() {
            let stmt = &statements[i];
            if stmt.is_jump_target {
                break;
            }
            if let Some(t) = normal_text(stmt) {
                text.push_str(&t.text);
                i += 1;
                continue;
            }
            let next_is_text = statements
                .get(i + 1)
                .map(|n| normal_text(n).is_some() && !n.is_jump_target)
                .unwrap_or(false);
            if !next_is_text {
                break;
            }
            if let Some(no) = call_proc_no(stmt) {
                write!(text, "$({})", no).unwrap();
                i += 1;
                continue;
            }
            if matches!(stmt.kind, MesStatementKind::Line(_)) {
                i += 1;
                continue;
            }
            break;
        }
        out.push(TextPos {
            start,
            nr_stmts: i - start,
            text,
        });
    }
    out
}

/// Emit a substitution-file template: one numbered header per text run,
/// bodies left for the translator.
pub fn print_text_template(statements: &[MesStatement]) -> String {
    let mut out = String::new();
    for (i, pos) in text_positions(statements).iter().enumerate() {
        writeln!(out, "#{} \"{}\"", i, pos.text).unwrap();
        out.push('\n');
    }
    out
}

struct Encoder<'a> {
    ctx: &'a GameContext,
    out: Vec<MesStatement>,
    addr: u32,
}

impl<'a> Encoder<'a> {
    fn push_stmt(&mut self, kind: MesStatementKind) {
        let mut stmt = MesStatement::new(kind);
        stmt.address = self.addr;
        self.addr += statement_size(self.ctx, &stmt);
        stmt.next_address = self.addr;
        self.out.push(stmt);
    }

    fn push_text(&mut self, text: &str, zenkaku: bool) -> Result<()> {
        let kind = match self.ctx.variant {
            Variant::Ai5Win => {
                let t = MesText::new(text);
                if zenkaku {
                    MesStatementKind::Txt(t)
                } else {
                    MesStatementKind::Str(t)
                }
            }
            Variant::AiWin => {
                // AIWIN has a single text statement; odd-length hankaku
                // runs are padded out to a full cell.
                let mut text = text.to_string();
                if !zenkaku && text_columns(&text)? % 2 != 0 {
                    text.push('0');
                }
                MesStatementKind::Txt(MesText::new(text))
            }
        };
        self.push_stmt(kind);
        Ok(())
    }

    fn push_line(&mut self) {
        if self.ctx.variant == Variant::Ai5Win {
            self.push_stmt(MesStatementKind::Line(0));
        }
    }

    fn push_call(&mut self, no: u32) {
        self.push_stmt(MesStatementKind::CallProc(vec![MesParameter::Expr(
            MesExpression::imm(no),
        )]));
    }

    // Clone one original statement into the output, recording its old
    // address in the translation table when anything jumps at it.
    fn copy_stmt(
        &mut self,
        table: &mut HashMap<u32, usize>,
        stmt: &MesStatement,
    ) -> Result<()> {
        if stmt.is_jump_target && table.insert(stmt.address, self.out.len()).is_some() {
            bail!("multiple statements at address 0x{:08x}", stmt.address);
        }
        let mut stmt = stmt.clone();
        stmt.address = self.addr;
        self.addr += statement_size(self.ctx, &stmt);
        stmt.next_address = self.addr;
        self.out.push(stmt);
        Ok(())
    }
}

// Split replacement text at hankaku/zenkaku boundaries and $(n) calls,
// emitting one statement per homogeneous run, with Line(0) between lines
// narrower than the configured column width.
fn encode_substitution(enc: &mut Encoder, sub: &MesTextSub) -> Result<bool> {
    if sub.to.is_empty() {
        // Untranslated line: the original text goes back in as a single
        // statement whose class is decided by its first character alone.
        warn!("no substitution for string {}", sub.no);
        let zenkaku = match sub.from.chars().next() {
            Some(c) => sjis::char_width(c)? == 2,
            None => false,
        };
        enc.push_text(&sub.from, zenkaku)?;
        return Ok(false);
    }

    let lines = &sub.to;
    for (line_no, line) in lines.iter().enumerate() {
        let s = line.text.as_str();
        let bytes = s.as_bytes();
        let mut run_start = 0usize;
        let mut run_zenkaku = false;
        let mut i = 0usize;
        while i < bytes.len() {
            if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'(') {
                let Some(close) = s[i + 2..].find(')') else {
                    bail!("invalid '$' call in string: {:?}", s);
                };
                let no: u32 = s[i + 2..i + 2 + close].trim().parse()?;
                if i > run_start {
                    enc.push_text(&s[run_start..i], run_zenkaku)?;
                }
                enc.push_call(no);
                i += 2 + close + 1;
                run_start = i;
                continue;
            }
            let (next_zenkaku, advance) = if bytes[i] == b'\\' {
                match bytes.get(i + 1) {
                    Some(b'X') => (true, 6),
                    Some(b'x') => (false, 4),
                    Some(b'n') | Some(b't') | Some(b'$') | Some(b'\\') | Some(b'"') => {
                        (false, 2)
                    }
                    _ => bail!("invalid escape in string: {:?}", s),
                }
            } else {
                let ch = s[i..].chars().next().unwrap();
                (sjis::char_width(ch)? == 2, ch.len_utf8())
            };
            if i > run_start && run_zenkaku != next_zenkaku {
                enc.push_text(&s[run_start..i], run_zenkaku)?;
                run_start = i;
            }
            run_zenkaku = next_zenkaku;
            i += advance;
        }
        if i > run_start {
            enc.push_text(&s[run_start..i], run_zenkaku)?;
        }
        if line_no + 1 < lines.len() {
            if line.columns < sub.columns {
                enc.push_line();
            }
            if sub.columns > 0 && line.columns > sub.columns {
                warn!(
                    "line {} of substitution {} exceeds configured columns",
                    line_no, sub.no
                );
            }
        }
    }
    Ok(true)
}

/// Apply a substitution list, returning a new statement list with all
/// addresses reassigned and every jump rewritten to the statement that
/// carried its original target address.
pub fn substitute_text(
    ctx: &GameContext,
    statements: &[MesStatement],
    subs: MesTextSubList,
) -> Result<Vec<MesStatement>> {
    let positions = text_positions(statements);

    // Sparse pairing of positions with their substitutions.
    let mut by_pos: Vec<Option<MesTextSub>> = (0..positions.len()).map(|_| None).collect();
    for sub in subs {
        ensure!(
            sub.no < positions.len(),
            "invalid string number in substitution: {}",
            sub.no
        );
        let no = sub.no;
        by_pos[no] = Some(sub);
    }

    // Jump targets keyed by original address; values are indices into the
    // output list.
    let mut table: HashMap<u32, usize> = HashMap::new();
    let mut enc = Encoder {
        ctx,
        out: Vec::new(),
        addr: 0,
    };
    let mut missing = 0usize;

    let mut mes_pos = 0usize;
    for (i, pos) in positions.iter().enumerate() {
        let Some(sub) = &by_pos[i] else {
            continue;
        };
        while mes_pos < pos.start {
            enc.copy_stmt(&mut table, &statements[mes_pos])?;
            mes_pos += 1;
        }
        let n = enc.out.len();
        if !encode_substitution(&mut enc, sub)? {
            missing += 1;
        }
        let head = &statements[pos.start];
        if head.is_jump_target {
            if table.insert(head.address, n).is_some() {
                bail!("multiple statements at address 0x{:08x}", head.address);
            }
            if let Some(stmt) = enc.out.get_mut(n) {
                stmt.is_jump_target = true;
            }
        }
        mes_pos += pos.nr_stmts;
    }
    while mes_pos < statements.len() {
        enc.copy_stmt(&mut table, &statements[mes_pos])?;
        mes_pos += 1;
    }

    // Rewrite every address operand through the table.
    let end_addr = enc.addr;
    let resolved: HashMap<u32, u32> = table
        .iter()
        .map(|(&old, &idx)| {
            let new = enc.out.get(idx).map(|s| s.address).unwrap_or(end_addr);
            (old, new)
        })
        .collect();
    for stmt in &mut enc.out {
        if let Some(addr) = stmt.kind.target_addr_mut() {
            match resolved.get(addr) {
                Some(&new) => *addr = new,
                None => bail!("address lookup failed for 0x{:08x}", addr),
            }
        }
    }

    if missing > 0 {
        warn!("{} lines without substitutions", missing);
    }
    Ok(enc.out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{pack_statements, parse_statements, Game, GameContext};

    fn ctx() -> &'static GameContext {
        GameContext::for_game(Game::ElfClassics)
    }

    // Three sequential Txt statements, the second a jump target of a later
    // Jmp, then END.
    fn three_texts() -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[0x01, 0x82, 0xa0, 0x00]); // "あ"
        let second = bytes.len() as u32;
        bytes.extend_from_slice(&[0x01, 0x82, 0xa2, 0x00]); // "い"
        bytes.extend_from_slice(&[0x01, 0x82, 0xa4, 0x00]); // "う"
        bytes.push(0x0c); // JMP -> second
        bytes.extend_from_slice(&second.to_le_bytes());
        bytes.push(0x00); // END
        bytes
    }

    #[test]
    fn empty_substitution_is_address_identical() -> Result<()> {
        let stmts = parse_statements(ctx(), &three_texts())?;
        let out = substitute_text(ctx(), &stmts, MesTextSubList::new())?;
        assert_eq!(out, stmts);
        Ok(())
    }

    #[test]
    fn lengthening_moves_jump_target() -> Result<()> {
        let stmts = parse_statements(ctx(), &three_texts())?;
        let subs = parse_text_subs("#0 \"あ\"\nああ\n")?;
        let out = substitute_text(ctx(), &stmts, subs)?;

        // The first text doubled from 2 to 4 packed bytes, so the second
        // text moved from 4 to 6.
        let second = out
            .iter()
            .find(|s| s.is_jump_target)
            .expect("jump target lost");
        assert_eq!(second.address, 6);
        let jmp = out
            .iter()
            .find_map(|s| match &s.kind {
                MesStatementKind::Jmp { addr } => Some(*addr),
                _ => None,
            })
            .expect("no Jmp");
        assert_eq!(jmp, second.address);

        // Re-parsing the assembled output recovers three Txt statements.
        let packed = pack_statements(ctx(), &out)?;
        let reparsed = parse_statements(ctx(), &packed)?;
        let texts = reparsed
            .iter()
            .filter(|s| matches!(s.kind, MesStatementKind::Txt(_)))
            .count();
        assert_eq!(texts, 3);
        Ok(())
    }

    #[test]
    fn splits_mixed_classes_and_calls() -> Result<()> {
        // One hankaku run, END.
        let bytes = [0x02, b'x', 0x00, 0x00];
        let stmts = parse_statements(ctx(), &bytes)?;
        let subs = parse_text_subs("#0 \"x\"\nAB$(5)あ\n")?;
        let out = substitute_text(ctx(), &stmts, subs)?;
        let kinds: Vec<_> = out.iter().map(|s| s.kind.op()).collect();
        assert_eq!(
            kinds,
            vec![
                crate::StmtOp::Str,
                crate::StmtOp::CallProc,
                crate::StmtOp::Txt,
                crate::StmtOp::End
            ]
        );
        match &out[1].kind {
            MesStatementKind::CallProc(params) => {
                assert_eq!(
                    params[0],
                    MesParameter::Expr(MesExpression::Imm8(5))
                );
            }
            other => panic!("unexpected statement: {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn inserts_line_breaks_below_column_width() -> Result<()> {
        let bytes = [0x02, b'x', 0x00, 0x00];
        let stmts = parse_statements(ctx(), &bytes)?;
        let subs = parse_text_subs("#columns = 10\n#0 \"x\"\nAB\nCD\n")?;
        let out = substitute_text(ctx(), &stmts, subs)?;
        let kinds: Vec<_> = out.iter().map(|s| s.kind.op()).collect();
        assert_eq!(
            kinds,
            vec![
                crate::StmtOp::Str,
                crate::StmtOp::Line,
                crate::StmtOp::Str,
                crate::StmtOp::End
            ]
        );
        Ok(())
    }

    #[test]
    fn missing_substitution_preserves_original_text() -> Result<()> {
        // A header with an empty body warns and keeps the original text.
        let bytes = [0x02, b'x', 0x00, 0x00];
        let stmts = parse_statements(ctx(), &bytes)?;
        let subs = parse_text_subs("#0 \"x\"\n\n")?;
        assert!(subs[0].to.is_empty());
        let out = substitute_text(ctx(), &stmts, subs)?;
        assert_eq!(out.len(), 2);
        match &out[0].kind {
            MesStatementKind::Str(t) => {
                assert_eq!(t.text, "x");
                assert!(t.terminated);
            }
            other => panic!("unexpected statement: {:?}", other),
        }
        assert_eq!(pack_statements(ctx(), &out)?, bytes);

        // The re-encode is a single statement classed by the first
        // character only, even when the original text mixes classes.
        let subs = parse_text_subs("#0 \"ABあ\"\n\n")?;
        let out = substitute_text(ctx(), &stmts, subs)?;
        assert_eq!(out.len(), 2);
        match &out[0].kind {
            MesStatementKind::Str(t) => assert_eq!(t.text, "ABあ"),
            other => panic!("unexpected statement: {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn parses_sub_file_with_comments() -> Result<()> {
        let subs = parse_text_subs(
            "## translation file\n#columns = 24\n\n#3 \"old text\"\nnew text line\n## note\nsecond line\n\n",
        )?;
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].no, 3);
        assert_eq!(subs[0].from, "old text");
        assert_eq!(subs[0].columns, 24);
        assert_eq!(subs[0].to.len(), 2);
        assert_eq!(subs[0].to[0].text, "new text line");
        Ok(())
    }

    #[test]
    fn template_lists_runs_with_calls() -> Result<()> {
        // "あ" $5 "い" END — one run with an embedded call.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[0x01, 0x82, 0xa0, 0x00]);
        bytes.extend_from_slice(&[0x11, 0x02, 0x05, 0xff, 0x00]); // CALL(5)
        bytes.extend_from_slice(&[0x01, 0x82, 0xa2, 0x00]);
        bytes.push(0x00);
        let stmts = parse_statements(ctx(), &bytes)?;
        let template = print_text_template(&stmts);
        assert_eq!(template, "#0 \"あ$(5)い\"\n\n");
        Ok(())
    }
}
