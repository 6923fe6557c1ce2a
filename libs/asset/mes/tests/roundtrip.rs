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

// End-to-end checks over the whole pipeline: packed size vs. emitted
// bytes, parse/assemble identity, decompile -> print -> recompile, and
// text substitution address stability.

use anyhow::Result;
use mes::{
    decompile, decompile_blocks, pack_statements, parse_smes, parse_statements, parse_text_subs,
    print_ast, statement_size, substitute_text, Game, GameContext, MesAstKind, MesExpression,
    MesParameter, MesStatement, MesStatementKind, MesText,
};

fn classics() -> &'static GameContext {
    GameContext::for_game(Game::ElfClassics)
}

// Surface the library's warnings (unprefixed text, invalid pairs, missing
// substitutions) when running with RUST_LOG set.
fn logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// One statement of every shape the format has, ending in END. Jumps target
// offset zero so the list parses standalone.
fn statement_zoo(ctx: &GameContext) -> Vec<MesStatement> {
    use MesExpression as E;
    use MesStatementKind as K;
    let mut kinds = vec![
        K::SetFlagConst {
            var_no: 4096,
            vals: vec![E::imm(1)],
        },
        K::SetFlagExpr {
            var_expr: E::Binary {
                op: mes::BinaryOp::Add,
                lhs: Box::new(E::GetVar16(2)),
                rhs: Box::new(E::imm(3)),
            },
            vals: vec![E::imm(0), E::imm(1)],
        },
        K::SetVar16 {
            var_no: 7,
            vals: vec![E::Rand(Box::new(if ctx.rand_is_postfix {
                E::imm(6)
            } else {
                E::Imm16(6)
            }))],
        },
        K::SetVar32 {
            var_no: 9,
            vals: vec![E::Imm32(0x12345678)],
        },
        K::Ptr16Set8 {
            var_no: 1,
            off: E::imm(4),
            vals: vec![E::imm(2)],
        },
        K::Ptr16Set16 {
            var_no: 0,
            off: E::imm(7),
            vals: vec![E::Imm16(640)],
        },
        K::Ptr32Set32 {
            var_no: 0,
            off: E::imm(5),
            vals: vec![E::GetVar32(1)],
        },
        K::Jz {
            cond: E::GetFlagConst(3),
            addr: 0,
        },
        K::Jmp { addr: 0 },
        K::Sys {
            expr: E::imm(2),
            params: vec![
                MesParameter::Expr(E::imm(0)),
                MesParameter::Str("CURSOR1.CUR".into()),
            ],
        },
        K::JmpMes(vec![MesParameter::Str("MAIN.MES".into())]),
        K::CallMes(vec![
            MesParameter::Str("SUB.MES".into()),
            MesParameter::Expr(E::imm(1)),
        ]),
        K::CallProc(vec![MesParameter::Expr(E::imm(5))]),
        K::Util(vec![MesParameter::Expr(E::imm(3))]),
        K::MenuExec(Vec::new()),
        K::Line(0),
        K::Txt(MesText::new("こんにちは\\X823f")),
        K::Str(MesText::new("hi\\n\\x1f")),
    ];
    if ctx.game == Game::ElfClassics {
        kinds.push(K::Ptr32Set8 {
            var_no: 2,
            off: E::imm(0),
            vals: vec![E::imm(1)],
        });
        kinds.push(K::Ptr32Set16 {
            var_no: 2,
            off: E::imm(0),
            vals: vec![E::imm(1)],
        });
    }
    kinds.push(K::End);
    kinds.into_iter().map(MesStatement::new).collect()
}

#[test]
fn size_matches_assembled_bytes_per_game() -> Result<()> {
    logging();
    for game in [
        Game::ElfClassics,
        Game::Yuno,
        Game::Doukyuusei,
        Game::Shuusaku,
        Game::Kawarazakike,
    ] {
        let ctx = GameContext::for_game(game);
        let stmts = statement_zoo(ctx);
        let packed = pack_statements(ctx, &stmts)?;
        let parsed = parse_statements(ctx, &packed)?;
        assert_eq!(parsed.len(), stmts.len(), "game {:?}", game);
        for (orig, reparsed) in stmts.iter().zip(&parsed) {
            assert_eq!(orig.kind, reparsed.kind, "game {:?}", game);
            assert_eq!(
                reparsed.next_address - reparsed.address,
                statement_size(ctx, reparsed),
                "game {:?} statement {:?}",
                game,
                reparsed.kind.op()
            );
        }
        // Full parse -> assemble identity.
        assert_eq!(pack_statements(ctx, &parsed)?, packed, "game {:?}", game);
    }
    Ok(())
}

// --- scenario fixtures ---

// S2, as a compiler would emit it: both arms jump to the join.
fn diamond_six() -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&[0x0b, 0x80, 0x00, 0x01, 0xef, 0xff]);
    let jz = bytes.len();
    bytes.extend_from_slice(&[0; 4]);
    bytes.extend_from_slice(&[0x04, 0x01, 0x02, 0xff, 0x00]);
    bytes.push(0x0c);
    let jmp1 = bytes.len();
    bytes.extend_from_slice(&[0; 4]);
    let else_addr = bytes.len() as u32;
    bytes.extend_from_slice(&[0x04, 0x01, 0x03, 0xff, 0x00]);
    bytes.push(0x0c);
    let jmp2 = bytes.len();
    bytes.extend_from_slice(&[0; 4]);
    let end_addr = bytes.len() as u32;
    bytes.push(0x00);
    bytes[jz..jz + 4].copy_from_slice(&else_addr.to_le_bytes());
    bytes[jmp1..jmp1 + 4].copy_from_slice(&end_addr.to_le_bytes());
    bytes[jmp2..jmp2 + 4].copy_from_slice(&end_addr.to_le_bytes());
    bytes
}

// The same diamond with a fallthrough else arm; this shape recompiles
// byte-exactly.
fn diamond_five() -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&[0x0b, 0x80, 0x00, 0x01, 0xef, 0xff]);
    let jz = bytes.len();
    bytes.extend_from_slice(&[0; 4]);
    bytes.extend_from_slice(&[0x04, 0x01, 0x02, 0xff, 0x00]);
    bytes.push(0x0c);
    let jmp = bytes.len();
    bytes.extend_from_slice(&[0; 4]);
    let else_addr = bytes.len() as u32;
    bytes.extend_from_slice(&[0x04, 0x01, 0x03, 0xff, 0x00]);
    let end_addr = bytes.len() as u32;
    bytes.push(0x00);
    bytes[jz..jz + 4].copy_from_slice(&else_addr.to_le_bytes());
    bytes[jmp..jmp + 4].copy_from_slice(&end_addr.to_le_bytes());
    bytes
}

// S3: init; while (var4[0]) { if (var4[1]) break; var16[0] += 1; } END
fn loop_with_break() -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&[0x04, 0x00, 0x00, 0xff, 0x00]);
    let head = bytes.len() as u32;
    bytes.extend_from_slice(&[0x0b, 0xf3, 0x00, 0x00, 0xff]);
    let jz_while = bytes.len();
    bytes.extend_from_slice(&[0; 4]);
    bytes.extend_from_slice(&[0x0b, 0xf3, 0x01, 0x00, 0xff]);
    let jz_if = bytes.len();
    bytes.extend_from_slice(&[0; 4]);
    bytes.push(0x0c);
    let jmp_brk = bytes.len();
    bytes.extend_from_slice(&[0; 4]);
    let incr = bytes.len() as u32;
    bytes.extend_from_slice(&[0x04, 0x00, 0x80, 0x00, 0x01, 0xe0, 0xff, 0x00]);
    bytes.push(0x0c);
    bytes.extend_from_slice(&head.to_le_bytes());
    let end = bytes.len() as u32;
    bytes.push(0x00);
    bytes[jz_while..jz_while + 4].copy_from_slice(&end.to_le_bytes());
    bytes[jz_if..jz_if + 4].copy_from_slice(&incr.to_le_bytes());
    bytes[jmp_brk..jmp_brk + 4].copy_from_slice(&end.to_le_bytes());
    bytes
}

// S4: a procedure, then a menu entry, then menuexec.
fn procedure_and_menu() -> Vec<u8> {
    let mut bytes = Vec::new();
    // defproc 1 { line 0; }
    bytes.extend_from_slice(&[0x14, 0x01, 0xff]);
    let proc_skip = bytes.len();
    bytes.extend_from_slice(&[0; 4]);
    bytes.extend_from_slice(&[0x13, 0x00]);
    bytes.push(0x00); // procedure END
    let after_proc = bytes.len() as u32;
    bytes[proc_skip..proc_skip + 4].copy_from_slice(&after_proc.to_le_bytes());
    // menu[(1)] = { line 2; }
    bytes.extend_from_slice(&[0x10, 0x02, 0x01, 0xff, 0x00]);
    let menu_skip = bytes.len();
    bytes.extend_from_slice(&[0; 4]);
    bytes.extend_from_slice(&[0x13, 0x02]);
    bytes.push(0x00); // menu END
    let after_menu = bytes.len() as u32;
    bytes[menu_skip..menu_skip + 4].copy_from_slice(&after_menu.to_le_bytes());
    bytes.push(0x15); // menuexec
    bytes.push(0x00); // toplevel END
    bytes
}

fn recompiles_identically(ctx: &GameContext, bytes: &[u8]) -> Result<()> {
    let ast = decompile(ctx, bytes)?;
    let text = print_ast(&ast);
    let stmts = parse_smes(ctx, &text)?;
    let packed = pack_statements(ctx, &stmts)?;
    assert_eq!(packed, bytes, "source:\n{}", text);
    Ok(())
}

#[test]
fn s1_empty_file() -> Result<()> {
    let ast = decompile(classics(), &[0x00])?;
    let text = print_ast(&ast);
    assert!(text.is_empty(), "expected empty output, got {:?}", text);
    let stmts = parse_smes(classics(), &text)?;
    assert_eq!(pack_statements(classics(), &stmts)?, vec![0x00]);
    Ok(())
}

#[test]
fn s2_two_branch_conditional() -> Result<()> {
    let bytes = diamond_six();
    let stmts = parse_statements(classics(), &bytes)?;
    assert_eq!(stmts.len(), 6);
    assert_eq!(pack_statements(classics(), &stmts)?, bytes);

    let cfg = decompile_blocks(classics(), &bytes)?;
    assert_eq!(cfg.blocks[cfg.toplevel].compound().children.len(), 4);

    let ast = decompile(classics(), &bytes)?;
    let has_alt = ast.iter().any(|n| {
        matches!(
            &n.kind,
            MesAstKind::Cond { alternative, .. } if !alternative.is_empty()
        )
    });
    assert!(has_alt);

    // The fallthrough-else shape survives recompilation byte-for-byte.
    recompiles_identically(classics(), &diamond_five())
}

#[test]
fn s3_loop_with_break_recompiles() -> Result<()> {
    let bytes = loop_with_break();
    let ast = decompile(classics(), &bytes)?;
    let text = print_ast(&ast);
    assert!(text.contains("while (var4[0]) {"));
    assert!(text.contains("break;"));
    // Converge-point subtraction ate the break label.
    assert!(!text.contains("L_"), "label leaked:\n{}", text);
    recompiles_identically(classics(), &bytes)
}

#[test]
fn s4_procedure_and_menu() -> Result<()> {
    let bytes = procedure_and_menu();
    let ast = decompile(classics(), &bytes)?;
    let mut saw_proc = false;
    let mut saw_menu = false;
    for node in &ast {
        match &node.kind {
            MesAstKind::Procedure { body, .. } => {
                saw_proc = true;
                assert!(!body.is_empty());
            }
            MesAstKind::MenuEntry { body, .. } => {
                saw_menu = true;
                assert!(!body.is_empty());
            }
            _ => {}
        }
    }
    assert!(saw_proc && saw_menu);
    recompiles_identically(classics(), &bytes)
}

#[test]
fn s5_substitution_keeps_jump_semantics() -> Result<()> {
    // Covered in depth in the text module; here the full pipeline: parse,
    // substitute, assemble, re-parse, compare jump targets.
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&[0x01, 0x82, 0xa0, 0x00]);
    let second = bytes.len() as u32;
    bytes.extend_from_slice(&[0x01, 0x82, 0xa2, 0x00]);
    bytes.extend_from_slice(&[0x01, 0x82, 0xa4, 0x00]);
    bytes.push(0x0c);
    bytes.extend_from_slice(&second.to_le_bytes());
    bytes.push(0x00);

    let stmts = parse_statements(classics(), &bytes)?;
    let subs = parse_text_subs("#0 \"あ\"\nあああああ\n")?;
    let out = substitute_text(classics(), &stmts, subs)?;
    let packed = pack_statements(classics(), &out)?;
    let reparsed = parse_statements(classics(), &packed)?;

    let target = reparsed.iter().find(|s| s.is_jump_target).unwrap();
    match &target.kind {
        MesStatementKind::Txt(t) => assert_eq!(t.text, "い"),
        other => panic!("jump target moved onto {:?}", other),
    }
    Ok(())
}

#[test]
fn s6_unprefixed_text_reassembles() -> Result<()> {
    logging();
    // '~' is no statement opcode and no zenkaku lead byte.
    let bytes = [b'~', b'!', 0x00, 0x00];
    let stmts = parse_statements(classics(), &bytes)?;
    match &stmts[0].kind {
        MesStatementKind::Str(t) => {
            assert!(t.unprefixed);
            assert_eq!(t.text, "~!");
        }
        other => panic!("unexpected statement: {:?}", other),
    }
    assert_eq!(pack_statements(classics(), &stmts)?, bytes);
    Ok(())
}

#[test]
fn flat_listing_recompiles_identically() -> Result<()> {
    for bytes in [diamond_six(), diamond_five(), loop_with_break(), procedure_and_menu()] {
        let stmts = parse_statements(classics(), &bytes)?;
        let text = mes::print_flat_statements(&stmts);
        let recompiled = parse_smes(classics(), &text)?;
        assert_eq!(
            pack_statements(classics(), &recompiled)?,
            bytes,
            "listing:\n{}",
            text
        );
    }
    Ok(())
}

#[test]
fn substitution_is_stable_under_empty_set() -> Result<()> {
    for bytes in [diamond_six(), loop_with_break(), procedure_and_menu()] {
        let stmts = parse_statements(classics(), &bytes)?;
        let out = substitute_text(classics(), &stmts, Vec::new())?;
        assert_eq!(out, stmts);
    }
    Ok(())
}

#[test]
fn dominance_satisfies_frontier_definition() -> Result<()> {
    let cfg = decompile_blocks(classics(), &loop_with_break())?;
    let order = cfg.blocks[cfg.toplevel].compound().post_order.clone();
    assert!(!order.is_empty());
    let entry = *order.last().unwrap(); // entry has the highest post number

    let dominates =
        |b: usize, x: usize| -> bool { b == x || cfg.blocks[b].dom.contains(&x) };

    for &b in &order {
        if b == entry {
            continue;
        }
        for &f in &order {
            let in_df = cfg.blocks[b].dom_front.contains(&f);
            let dominates_a_pred = cfg.blocks[f]
                .pred
                .iter()
                .any(|&p| order.contains(&p) && dominates(b, p));
            let strictly_dominates = b != f && cfg.blocks[b].dom.contains(&f);
            assert_eq!(
                in_df,
                dominates_a_pred && !strictly_dominates,
                "DF property violated for b={} f={}",
                cfg.blocks[b].post,
                cfg.blocks[f].post
            );
        }
    }
    Ok(())
}

#[test]
fn aiwin_terminators_round_trip() -> Result<()> {
    let ctx = GameContext::for_game(Game::Shuusaku);
    // var16[1] = 2 with 0xff list terminator, text with 0xff terminator.
    let bytes = vec![
        0x04, 0x01, 0x02, 0xff, 0xff, // assignment, list term 0xff
        0x01, 0x82, 0xa0, 0xff, // TXT "あ" terminated by 0xff
        0x00, // END
    ];
    let stmts = parse_statements(ctx, &bytes)?;
    match &stmts[1].kind {
        MesStatementKind::Txt(t) => assert_eq!(t.text, "あ"),
        other => panic!("unexpected statement: {:?}", other),
    }
    assert_eq!(pack_statements(ctx, &stmts)?, bytes);
    Ok(())
}

#[test]
fn variant_headers_round_trip() -> Result<()> {
    // Kawarazakike: leading zero dword.
    let ctx = GameContext::for_game(Game::Kawarazakike);
    let bytes = vec![0, 0, 0, 0, 0x13, 0x07, 0x00];
    let stmts = parse_statements(ctx, &bytes)?;
    assert_eq!(stmts[0].address, 0);
    assert_eq!(pack_statements(ctx, &stmts)?, bytes);

    // Nonomura: procedure address table at the head.
    let ctx = GameContext::for_game(Game::Nonomura);
    let mut code = vec![0x12, 0x01, 0xff];
    code.extend_from_slice(&8u32.to_le_bytes());
    code.push(0x00);
    code.push(0x00);
    let mut file = Vec::new();
    file.extend_from_slice(&1u32.to_le_bytes());
    file.extend_from_slice(&0u32.to_le_bytes());
    file.extend_from_slice(&code);
    let stmts = parse_statements(ctx, &file)?;
    assert_eq!(pack_statements(ctx, &stmts)?, file);
    Ok(())
}
