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

// Per-game opcode tables and variant quirks. The virtual opcodes in the
// model do not correspond to the bytes of any particular game; every parse
// or pack call goes through the context selected here.

use crate::{ExprOp, MesStatementKind, StmtOp};
use anyhow::{anyhow, Result};
use lazy_static::lazy_static;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Variant {
    Ai5Win,
    AiWin,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Game {
    ElfClassics,
    Yukinojou,
    Yuno,
    Beyond,
    AiShimai,
    Koihime,
    Doukyuusei,
    Kakyuusei,
    Isaku,
    Nonomura,
    Kawarazakike,
    AllStars,
    Shuusaku,
    Shangrlia,
    Shangrlia2,
}

impl Game {
    pub const ALL: [Game; 15] = [
        Game::ElfClassics,
        Game::Yukinojou,
        Game::Yuno,
        Game::Beyond,
        Game::AiShimai,
        Game::Koihime,
        Game::Doukyuusei,
        Game::Kakyuusei,
        Game::Isaku,
        Game::Nonomura,
        Game::Kawarazakike,
        Game::AllStars,
        Game::Shuusaku,
        Game::Shangrlia,
        Game::Shangrlia2,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Game::ElfClassics => "elf-classics",
            Game::Yukinojou => "yukinojou",
            Game::Yuno => "yuno",
            Game::Beyond => "beyond",
            Game::AiShimai => "aishimai",
            Game::Koihime => "koihime",
            Game::Doukyuusei => "doukyuusei",
            Game::Kakyuusei => "kakyuusei",
            Game::Isaku => "isaku",
            Game::Nonomura => "nonomura",
            Game::Kawarazakike => "kawarazakike",
            Game::AllStars => "allstars",
            Game::Shuusaku => "shuusaku",
            Game::Shangrlia => "shangrlia",
            Game::Shangrlia2 => "shangrlia2",
        }
    }

    pub fn from_name(name: &str) -> Result<Game> {
        Game::ALL
            .iter()
            .copied()
            .find(|g| g.name() == name)
            .ok_or_else(|| anyhow!("unknown game: {}", name))
    }

    pub fn variant(self) -> Variant {
        match self {
            Game::Kawarazakike
            | Game::AllStars
            | Game::Shuusaku
            | Game::Shangrlia
            | Game::Shangrlia2 => Variant::AiWin,
            _ => Variant::Ai5Win,
        }
    }
}

/// Variant-specific file framing handled by the assembler epilogue and
/// skipped by the parser prologue.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IndexHeader {
    None,
    /// u32 count followed by the addresses of the DefProc statements.
    NonomuraTable,
    /// Four zero bytes ahead of the statement stream.
    KawarazakikeHeader,
}

/// Structural statement category used by the CFG; collapses both engine
/// variants onto the handful of shapes control-flow analysis cares about.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Vop {
    End,
    Jz,
    Jmp,
    DefProc,
    DefMenu,
    Other,
}

struct Tables {
    stmt_to_byte: [Option<u8>; StmtOp::COUNT],
    byte_to_stmt: [Option<StmtOp>; 256],
    expr_to_byte: [Option<u8>; ExprOp::COUNT],
    byte_to_expr: [ExprOp; 256],
}

impl Tables {
    fn build(stmt_pairs: &[(StmtOp, u8)], expr_pairs: &[(ExprOp, u8)]) -> Self {
        let mut stmt_to_byte = [None; StmtOp::COUNT];
        let mut byte_to_stmt = [None; 256];
        for &(op, b) in stmt_pairs {
            assert!(stmt_to_byte[op.index()].is_none());
            assert!(byte_to_stmt[b as usize].is_none());
            stmt_to_byte[op.index()] = Some(b);
            byte_to_stmt[b as usize] = Some(op);
        }
        // Any byte not claimed by an expression opcode reads back as an
        // inline immediate of that byte's value.
        let mut expr_to_byte = [None; ExprOp::COUNT];
        let mut byte_to_expr = [ExprOp::Imm; 256];
        for &(op, b) in expr_pairs {
            assert!(expr_to_byte[op.index()].is_none());
            expr_to_byte[op.index()] = Some(b);
            byte_to_expr[b as usize] = op;
        }
        Self {
            stmt_to_byte,
            byte_to_stmt,
            expr_to_byte,
            byte_to_expr,
        }
    }
}

// The shared tail of every expression table: the operator block at 0xE0 and
// the wide-operand block at 0xF1.
const EXPR_COMMON: [(ExprOp, u8); 25] = [
    (ExprOp::GetVar16, 0x80),
    (ExprOp::Ptr16Get16, 0xa0),
    (ExprOp::Ptr16Get8, 0xc0),
    (ExprOp::Plus, 0xe0),
    (ExprOp::Minus, 0xe1),
    (ExprOp::Mul, 0xe2),
    (ExprOp::Div, 0xe3),
    (ExprOp::Mod, 0xe4),
    (ExprOp::Rand, 0xe5),
    (ExprOp::LogAnd, 0xe6),
    (ExprOp::LogOr, 0xe7),
    (ExprOp::BitAnd, 0xe8),
    (ExprOp::BitIor, 0xe9),
    (ExprOp::BitXor, 0xea),
    (ExprOp::Lt, 0xeb),
    (ExprOp::Gt, 0xec),
    (ExprOp::Lte, 0xed),
    (ExprOp::Gte, 0xee),
    (ExprOp::Eq, 0xef),
    (ExprOp::Neq, 0xf0),
    (ExprOp::Imm16, 0xf1),
    (ExprOp::Imm32, 0xf2),
    (ExprOp::GetFlagConst, 0xf3),
    (ExprOp::GetFlagExpr, 0xf4),
    (ExprOp::End, 0xff),
];

fn classics_tables() -> Tables {
    let stmt = [
        (StmtOp::End, 0x00),
        (StmtOp::Txt, 0x01),
        (StmtOp::Str, 0x02),
        (StmtOp::SetFlagConst, 0x03),
        (StmtOp::SetVar16, 0x04),
        (StmtOp::SetFlagExpr, 0x05),
        (StmtOp::Ptr16Set8, 0x06),
        (StmtOp::Ptr16Set16, 0x07),
        (StmtOp::Ptr32Set32, 0x08),
        (StmtOp::Ptr32Set16, 0x09),
        (StmtOp::Ptr32Set8, 0x0a),
        (StmtOp::Jz, 0x0b),
        (StmtOp::Jmp, 0x0c),
        (StmtOp::Sys, 0x0d),
        (StmtOp::JmpMes, 0x0e),
        (StmtOp::CallMes, 0x0f),
        (StmtOp::DefMenu, 0x10),
        (StmtOp::CallProc, 0x11),
        (StmtOp::Util, 0x12),
        (StmtOp::Line, 0x13),
        (StmtOp::DefProc, 0x14),
        (StmtOp::MenuExec, 0x15),
        (StmtOp::SetVar32, 0x16),
    ];
    let mut expr = EXPR_COMMON.to_vec();
    expr.extend_from_slice(&[
        (ExprOp::Ptr32Get32, 0xf5),
        (ExprOp::Ptr32Get16, 0xf6),
        (ExprOp::Ptr32Get8, 0xf7),
        (ExprOp::GetVar32, 0xf8),
    ]);
    Tables::build(&stmt, &expr)
}

// Later AI5WIN titles dropped the two narrow var32 pointer writes and
// compacted the statement numbering above them.
fn modern_tables() -> Tables {
    let stmt = [
        (StmtOp::End, 0x00),
        (StmtOp::Txt, 0x01),
        (StmtOp::Str, 0x02),
        (StmtOp::SetFlagConst, 0x03),
        (StmtOp::SetVar16, 0x04),
        (StmtOp::SetFlagExpr, 0x05),
        (StmtOp::Ptr16Set8, 0x06),
        (StmtOp::Ptr16Set16, 0x07),
        (StmtOp::Ptr32Set32, 0x08),
        (StmtOp::Jz, 0x09),
        (StmtOp::Jmp, 0x0a),
        (StmtOp::Sys, 0x0b),
        (StmtOp::JmpMes, 0x0c),
        (StmtOp::CallMes, 0x0d),
        (StmtOp::DefMenu, 0x0e),
        (StmtOp::CallProc, 0x0f),
        (StmtOp::Util, 0x10),
        (StmtOp::Line, 0x11),
        (StmtOp::DefProc, 0x12),
        (StmtOp::MenuExec, 0x13),
        (StmtOp::SetVar32, 0x14),
    ];
    let mut expr = EXPR_COMMON.to_vec();
    expr.extend_from_slice(&[(ExprOp::Ptr32Get32, 0xf5), (ExprOp::GetVar32, 0xf6)]);
    Tables::build(&stmt, &expr)
}

/// Everything variant- or game-specific the parser, size calculator and
/// assembler need. One per game, selected once per tool invocation.
pub struct GameContext {
    pub game: Game,
    pub variant: Variant,
    tables: Tables,
    pub rand_is_postfix: bool,
    pub index_header: IndexHeader,
}

impl GameContext {
    fn new(game: Game) -> Self {
        let variant = game.variant();
        let tables = match game {
            Game::ElfClassics => classics_tables(),
            _ => modern_tables(),
        };
        let rand_is_postfix = game != Game::Doukyuusei && variant != Variant::AiWin;
        let index_header = match game {
            Game::Nonomura => IndexHeader::NonomuraTable,
            Game::Kawarazakike => IndexHeader::KawarazakikeHeader,
            _ => IndexHeader::None,
        };
        Self {
            game,
            variant,
            tables,
            rand_is_postfix,
            index_header,
        }
    }

    pub fn for_game(game: Game) -> &'static GameContext {
        lazy_static! {
            static ref CONTEXTS: Vec<GameContext> =
                Game::ALL.iter().map(|&g| GameContext::new(g)).collect();
        }
        &CONTEXTS[Game::ALL.iter().position(|&g| g == game).unwrap()]
    }

    pub fn stmt_opcode(&self, op: StmtOp) -> Option<u8> {
        self.tables.stmt_to_byte[op.index()]
    }

    pub fn stmt_op(&self, byte: u8) -> Option<StmtOp> {
        self.tables.byte_to_stmt[byte as usize]
    }

    pub fn expr_opcode(&self, op: ExprOp) -> Option<u8> {
        self.tables.expr_to_byte[op.index()]
    }

    pub fn expr_op(&self, byte: u8) -> ExprOp {
        self.tables.byte_to_expr[byte as usize]
    }

    /// Terminator for expression and parameter lists.
    pub fn list_term(&self) -> u8 {
        match self.variant {
            Variant::Ai5Win => 0x00,
            Variant::AiWin => 0xff,
        }
    }

    /// Terminator for text runs. AIWIN switched to 0xFF everywhere except
    /// Kawarazakike, which kept the NUL.
    pub fn string_term(&self) -> u8 {
        match (self.variant, self.game) {
            (Variant::AiWin, Game::Kawarazakike) => 0x00,
            (Variant::AiWin, _) => 0xff,
            (Variant::Ai5Win, _) => 0x00,
        }
    }

    /// The CFG's view of a statement. AIWIN menus are not compound blocks,
    /// so DefMenu classifies as Other there.
    pub fn vop(&self, kind: &MesStatementKind) -> Vop {
        match kind.op() {
            StmtOp::End => Vop::End,
            StmtOp::Jz => Vop::Jz,
            StmtOp::Jmp => Vop::Jmp,
            StmtOp::DefProc => Vop::DefProc,
            StmtOp::DefMenu if self.variant == Variant::Ai5Win => Vop::DefMenu,
            _ => Vop::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_are_bijective() {
        for &game in &Game::ALL {
            let ctx = GameContext::for_game(game);
            for b in 0..=255u8 {
                if let Some(op) = ctx.stmt_op(b) {
                    assert_eq!(ctx.stmt_opcode(op), Some(b));
                }
                let op = ctx.expr_op(b);
                if op != ExprOp::Imm {
                    assert_eq!(ctx.expr_opcode(op), Some(b));
                }
            }
        }
    }

    #[test]
    fn classics_keeps_narrow_pointer_writes() {
        let classics = GameContext::for_game(Game::ElfClassics);
        let modern = GameContext::for_game(Game::Yuno);
        assert_eq!(classics.stmt_opcode(StmtOp::Ptr32Set8), Some(0x0a));
        assert_eq!(modern.stmt_opcode(StmtOp::Ptr32Set8), None);
        assert_eq!(modern.stmt_opcode(StmtOp::Jz), Some(0x09));
        assert_eq!(classics.stmt_opcode(StmtOp::Jz), Some(0x0b));
    }

    #[test]
    fn variant_quirks() {
        let dk = GameContext::for_game(Game::Doukyuusei);
        assert!(!dk.rand_is_postfix);
        assert_eq!(dk.list_term(), 0x00);

        let shuusaku = GameContext::for_game(Game::Shuusaku);
        assert_eq!(shuusaku.variant, Variant::AiWin);
        assert_eq!(shuusaku.list_term(), 0xff);
        assert_eq!(shuusaku.string_term(), 0xff);
        assert!(!shuusaku.rand_is_postfix);

        let kw = GameContext::for_game(Game::Kawarazakike);
        assert_eq!(kw.string_term(), 0x00);
        assert_eq!(kw.index_header, IndexHeader::KawarazakikeHeader);

        let nn = GameContext::for_game(Game::Nonomura);
        assert_eq!(nn.index_header, IndexHeader::NonomuraTable);
    }

    #[test]
    fn aiwin_menus_are_not_compound() {
        let ai5 = GameContext::for_game(Game::Yuno);
        let aiw = GameContext::for_game(Game::AllStars);
        let defmenu = MesStatementKind::DefMenu {
            params: vec![],
            skip_addr: 0,
        };
        assert_eq!(ai5.vop(&defmenu), Vop::DefMenu);
        assert_eq!(aiw.vop(&defmenu), Vop::Other);
    }
}
