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

// Packed byte length of each statement, computed without emitting bytes.
// The substitution pipeline lays out every address with these numbers
// before the assembler runs, so any disagreement with pack.rs corrupts
// jump targets; the test suite pins size == packed length per variant.

use crate::{game::GameContext, MesExpression, MesParameter, MesStatement, MesStatementKind};
use log::warn;

fn expression_size_inner(ctx: &GameContext, expr: &MesExpression) -> u32 {
    match expr {
        MesExpression::Imm8(_) => 1,
        MesExpression::Imm16(_) | MesExpression::GetFlagConst(_) => 3,
        MesExpression::Imm32(_) => 5,
        MesExpression::GetVar16(_) | MesExpression::GetVar32(_) => 2,
        MesExpression::GetFlagExpr(index) => 1 + expression_size_inner(ctx, index),
        MesExpression::Ptr16Get8 { index, .. }
        | MesExpression::Ptr16Get16 { index, .. }
        | MesExpression::Ptr32Get8 { index, .. }
        | MesExpression::Ptr32Get16 { index, .. }
        | MesExpression::Ptr32Get32 { index, .. } => 2 + expression_size_inner(ctx, index),
        MesExpression::Rand(limit) => {
            if ctx.rand_is_postfix {
                1 + expression_size_inner(ctx, limit)
            } else {
                3
            }
        }
        MesExpression::Binary { lhs, rhs, .. } => {
            1 + expression_size_inner(ctx, lhs) + expression_size_inner(ctx, rhs)
        }
    }
}

/// Full packed size of one expression, including its END byte.
pub(crate) fn expression_size(ctx: &GameContext, expr: &MesExpression) -> u32 {
    expression_size_inner(ctx, expr) + 1
}

/// Each expression is followed by one separator or terminator byte; an
/// empty list packs as a lone terminator.
pub(crate) fn expression_list_size(ctx: &GameContext, exprs: &[MesExpression]) -> u32 {
    if exprs.is_empty() {
        return 1;
    }
    exprs.iter().map(|e| expression_size(ctx, e) + 1).sum()
}

/// Packed byte length of escaped string text. Walks the same escape set the
/// assembler consumes.
pub(crate) fn string_size(text: &str) -> u32 {
    let mut len = 0u32;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('X') => {
                    for _ in 0..4 {
                        chars.next();
                    }
                    len += 2;
                }
                Some('x') => {
                    chars.next();
                    chars.next();
                    len += 1;
                }
                Some(_) => len += 1,
                None => {
                    warn!("dangling escape in string: {:?}", text);
                }
            }
        } else {
            len += sjis::char_width(c).unwrap_or_else(|_| {
                warn!("unencodable character in string: {:?}", c);
                1
            }) as u32;
        }
    }
    len
}

pub(crate) fn parameter_list_size(ctx: &GameContext, params: &[MesParameter]) -> u32 {
    let mut len = 1; // terminator
    for p in params {
        len += 1; // type tag
        len += match p {
            MesParameter::Str(s) => string_size(s) + 1,
            MesParameter::Expr(e) => expression_size(ctx, e),
        };
    }
    len
}

fn text_size(text: &crate::MesText) -> u32 {
    let mut len = 1 + string_size(&text.text);
    if text.terminated {
        len += 1;
    }
    if text.unprefixed {
        len -= 1;
    }
    len
}

/// Exact number of bytes `pack_statements` will emit for this statement.
pub fn statement_size(ctx: &GameContext, stmt: &MesStatement) -> u32 {
    match &stmt.kind {
        MesStatementKind::End => 1,
        MesStatementKind::Txt(t) | MesStatementKind::Str(t) => text_size(t),
        MesStatementKind::SetFlagConst { vals, .. } => {
            3 + expression_list_size(ctx, vals)
        }
        MesStatementKind::SetFlagExpr { var_expr, vals } => {
            1 + expression_size(ctx, var_expr) + expression_list_size(ctx, vals)
        }
        MesStatementKind::SetVar16 { vals, .. } | MesStatementKind::SetVar32 { vals, .. } => {
            2 + expression_list_size(ctx, vals)
        }
        MesStatementKind::Ptr16Set8 { off, vals, .. }
        | MesStatementKind::Ptr16Set16 { off, vals, .. }
        | MesStatementKind::Ptr32Set8 { off, vals, .. }
        | MesStatementKind::Ptr32Set16 { off, vals, .. }
        | MesStatementKind::Ptr32Set32 { off, vals, .. } => {
            2 + expression_size(ctx, off) + expression_list_size(ctx, vals)
        }
        MesStatementKind::Jz { cond, .. } => 5 + expression_size(ctx, cond),
        MesStatementKind::Jmp { .. } => 5,
        MesStatementKind::Sys { expr, params } => {
            1 + expression_size(ctx, expr) + parameter_list_size(ctx, params)
        }
        MesStatementKind::JmpMes(params)
        | MesStatementKind::CallMes(params)
        | MesStatementKind::CallProc(params)
        | MesStatementKind::Util(params) => 1 + parameter_list_size(ctx, params),
        MesStatementKind::DefMenu { params, .. } => 5 + parameter_list_size(ctx, params),
        MesStatementKind::DefProc { no_expr, .. } => 5 + expression_size(ctx, no_expr),
        MesStatementKind::MenuExec(params) => {
            if ctx.game == crate::Game::Nonomura {
                1 + parameter_list_size(ctx, params)
            } else {
                1
            }
        }
        MesStatementKind::Line(_) => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Game, MesText};

    fn ctx() -> &'static GameContext {
        GameContext::for_game(Game::ElfClassics)
    }

    #[test]
    fn sizes_immediates() {
        assert_eq!(expression_size(ctx(), &MesExpression::Imm8(5)), 2);
        assert_eq!(expression_size(ctx(), &MesExpression::Imm16(300)), 4);
        assert_eq!(expression_size(ctx(), &MesExpression::Imm32(70000)), 6);
    }

    #[test]
    fn sizes_escaped_strings() {
        assert_eq!(string_size("AB"), 2);
        assert_eq!(string_size("\\n"), 1);
        assert_eq!(string_size("\\x1f"), 1);
        assert_eq!(string_size("\\X823f"), 2);
        assert_eq!(string_size("あい"), 4);
    }

    #[test]
    fn sizes_unprefixed_unterminated_text() {
        let stmt = crate::MesStatement::new(MesStatementKind::Str(MesText {
            text: "AB".into(),
            terminated: false,
            unprefixed: true,
        }));
        assert_eq!(statement_size(ctx(), &stmt), 2);
    }

    #[test]
    fn doukyuusei_rand_is_three_bytes() {
        let rand = MesExpression::Rand(Box::new(MesExpression::Imm16(100)));
        assert_eq!(
            expression_size(GameContext::for_game(Game::Doukyuusei), &rand),
            4
        );
        // Postfix form: op + imm(1 byte) + END.
        let rand = MesExpression::Rand(Box::new(MesExpression::Imm8(100)));
        assert_eq!(expression_size(ctx(), &rand), 3);
    }
}
