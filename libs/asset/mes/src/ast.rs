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

// CFG -> structured tree. Blocks are consumed by flipping in_ast as their
// statements move into the tree; whatever the walk never reaches is
// reported as a leak afterwards. A second phase rewrites the surviving
// Jmp statements into continue/break/goto or deletes them outright.

use crate::{
    cfg::{build_cfg, BlockId, MesBlock, MesCfg},
    game::{GameContext, Vop},
    parse_statements, MesAstKind, MesAstNode, MesStatement, MesStatementKind, StmtOp,
    SYNTHETIC_ADDRESS,
};
use anyhow::{bail, ensure, Result};
use log::warn;
use std::collections::{HashMap, HashSet};

/// Determine where the two arms of a conditional meet again. Both arms'
/// dominance frontiers are stripped of the arms themselves and of the
/// enclosing block's frontier; this keeps a `break` out of an inner arm
/// from dragging the loop exit in as a bogus converge point:
///
/// ```text
/// while (...) {          // parent block
///     if (...) {         // a
///         if (...) break;
///         ...
///     } else {           // b
///         ...
///     }
///     ...                // <- converge point
/// }
/// ...                    // <- must not count for a's frontier
/// ```
///
/// An arm that escapes entirely contributes nothing; two surviving distinct
/// candidates mean the file cannot be expressed as structured code and the
/// decompilation is abandoned.
fn arm_frontier(cfg: &MesCfg, arm: BlockId, frontier: &[BlockId]) -> Vec<BlockId> {
    cfg.blocks[arm]
        .dom_front
        .iter()
        .copied()
        .filter(|&blk| cfg.blocks[blk].post != cfg.blocks[arm].post && !frontier.contains(&blk))
        .collect()
}

fn converge_point(
    cfg: &MesCfg,
    a: BlockId,
    b: BlockId,
    frontier: &[BlockId],
) -> Result<Option<BlockId>> {
    let a_front = arm_frontier(cfg, a, frontier);
    let b_front = arm_frontier(cfg, b, frontier);

    if a_front.is_empty() && b_front.is_empty() {
        Ok(None)
    } else if a_front.len() == 1 && b_front.len() < 2 {
        Ok(Some(a_front[0]))
    } else if b_front.len() == 1 && a_front.len() < 2 {
        Ok(Some(b_front[0]))
    } else {
        bail!(
            "failed to find converge point of {} and {}",
            cfg.blocks[a].post,
            cfg.blocks[b].post
        );
    }
}

fn ast_create_node(
    ctx: &GameContext,
    cfg: &mut MesCfg,
    out: &mut Vec<MesAstNode>,
    parent: BlockId,
    head: BlockId,
    frontier: &[BlockId],
) -> Result<Option<BlockId>> {
    ensure!(
        !cfg.blocks[head].in_ast,
        "AST construction looped at block {}",
        cfg.blocks[head].post
    );
    cfg.blocks[head].in_ast = true;

    if cfg.blocks[head].is_compound() {
        let address = cfg.blocks[head].address;
        let next = cfg.blocks[head].compound().next;
        let first_child = cfg.blocks[head].compound().children.first().copied();
        let head_stmt = cfg.blocks[head]
            .compound_mut()
            .head
            .take()
            .expect("compound block without header");

        let mut body = Vec::new();
        if let Some(first_child) = first_child {
            ast_create_block(ctx, cfg, &mut body, head, first_child)?;
        }
        let kind = match head_stmt.kind {
            MesStatementKind::DefProc { no_expr, .. } => MesAstKind::Procedure {
                num_expr: no_expr,
                body,
            },
            MesStatementKind::DefMenu { params, .. } => MesAstKind::MenuEntry { params, body },
            other => bail!("unexpected compound header: {:?}", other.op()),
        };
        out.push(MesAstNode::new(address, kind));
        return Ok(next);
    }

    // Basic block: body statements first, then the edge decides the shape.
    let address = cfg.blocks[head].address;
    let statements = std::mem::take(&mut cfg.blocks[head].basic_mut().statements);
    if !statements.is_empty() {
        out.push(MesAstNode::new(address, MesAstKind::Statements(statements)));
    }

    let end_vop = cfg.blocks[head]
        .basic()
        .end
        .as_ref()
        .map(|s| ctx.vop(&s.kind));
    match end_vop {
        None => {
            // No edge statement: synthesize a Jmp to the fallthrough so
            // blocks can be freely reordered. Simplification removes it
            // again unless the target really moved.
            let fallthrough = cfg.blocks[head].basic().fallthrough;
            if let Some(fallthrough) = fallthrough {
                let jmp = MesStatement::synthetic(MesStatementKind::Jmp {
                    addr: cfg.blocks[fallthrough].address,
                });
                out.push(MesAstNode::new(
                    SYNTHETIC_ADDRESS,
                    MesAstKind::Statements(vec![jmp]),
                ));
            }
            Ok(fallthrough)
        }
        Some(Vop::Jz) => {
            let end = cfg.blocks[head].basic_mut().end.take().unwrap();
            let end_address = end.address;
            let condition = match end.kind {
                MesStatementKind::Jz { cond, .. } => cond,
                _ => unreachable!(),
            };
            let jump_target = cfg.blocks[head]
                .basic()
                .jump_target
                .expect("Jz without jump target");
            let fallthrough = cfg.blocks[head]
                .basic()
                .fallthrough
                .expect("Jz without fallthrough");

            if cfg.blocks[head].dom_front.contains(&head) {
                // Back edge to ourselves: while loop. The fallthrough is
                // the body, the jump target the continuation.
                let mut body = Vec::new();
                ast_create_block(ctx, cfg, &mut body, parent, fallthrough)?;
                out.push(MesAstNode::new(
                    end_address,
                    MesAstKind::Loop { condition, body },
                ));
                return Ok(Some(jump_target));
            }

            if jump_target == fallthrough {
                // Degenerate conditional with an empty body.
                out.push(MesAstNode::new(
                    end_address,
                    MesAstKind::Cond {
                        condition,
                        consequent: Vec::new(),
                        alternative: Vec::new(),
                    },
                ));
                return Ok(Some(fallthrough));
            }

            let mut consequent = Vec::new();
            let escaped = ast_create_block(ctx, cfg, &mut consequent, parent, fallthrough)?;

            // No else clause when the jump target is where the consequent
            // re-joins the parent flow, or when the consequent escapes its
            // scope outright (break/continue/return) and leaves no frontier
            // behind: the jump target is then the continuation.
            if cfg.blocks[fallthrough].dom_front.contains(&jump_target)
                || frontier.contains(&jump_target)
                || (escaped && arm_frontier(cfg, fallthrough, frontier).is_empty())
            {
                out.push(MesAstNode::new(
                    end_address,
                    MesAstKind::Cond {
                        condition,
                        consequent,
                        alternative: Vec::new(),
                    },
                ));
                return Ok(Some(jump_target));
            }

            let mut alternative = Vec::new();
            ast_create_block(ctx, cfg, &mut alternative, parent, jump_target)?;
            let converge = converge_point(cfg, fallthrough, jump_target, frontier)?;
            out.push(MesAstNode::new(
                end_address,
                MesAstKind::Cond {
                    condition,
                    consequent,
                    alternative,
                },
            ));
            Ok(converge)
        }
        Some(Vop::Jmp) | Some(Vop::End) => {
            // Goto or return: keep the statement verbatim; simplification
            // decides whether it survives.
            let end = cfg.blocks[head].basic_mut().end.take().unwrap();
            out.push(MesAstNode::new(
                end.address,
                MesAstKind::Statements(vec![end]),
            ));
            Ok(None)
        }
        Some(_) => bail!("unexpected statement as CFG edge"),
    }
}

// Returns true when the walk ended on an explicit Jmp/End edge rather than
// by reaching the frontier.
fn ast_create_block_inner(
    ctx: &GameContext,
    cfg: &mut MesCfg,
    out: &mut Vec<MesAstNode>,
    parent: BlockId,
    head: BlockId,
    frontier: &[BlockId],
) -> Result<bool> {
    let mut cursor = Some(head);
    while let Some(head) = cursor {
        cursor = ast_create_node(ctx, cfg, out, parent, head, frontier)?;
        if let Some(next) = cursor {
            if frontier.contains(&next) {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

fn ast_create_block(
    ctx: &GameContext,
    cfg: &mut MesCfg,
    out: &mut Vec<MesAstNode>,
    parent: BlockId,
    head: BlockId,
) -> Result<bool> {
    let frontier = cfg.blocks[head].dom_front.clone();
    let escaped = ast_create_block_inner(ctx, cfg, out, parent, head, &frontier)?;

    // Anything dominated by the head that the walk did not reach gets
    // appended at the end rather than silently dropped.
    let dominated = cfg.blocks[head].dom.clone();
    for p in dominated {
        if !cfg.blocks[p].in_ast {
            ast_create_block_inner(ctx, cfg, out, parent, p, &frontier)?;
        }
    }
    Ok(escaped)
}

fn ast_create(ctx: &GameContext, cfg: &mut MesCfg) -> Result<Vec<MesAstNode>> {
    let mut out = Vec::new();
    let first = match cfg.blocks[cfg.toplevel].compound().children.first() {
        Some(&first) => first,
        None => return Ok(out),
    };
    let head = cfg.alloc(MesBlock::synthetic_head(first));
    ast_create_block(ctx, cfg, &mut out, cfg.toplevel, head)?;
    Ok(out)
}

fn leak_check(cfg: &MesCfg, compound: BlockId) {
    for &b in &cfg.blocks[compound].compound().post_order {
        if !cfg.blocks[b].in_ast {
            warn!(
                "block {} (0x{:08x}) leaked from CFG to AST transformation",
                cfg.blocks[b].post, cfg.blocks[b].address
            );
        }
        if cfg.blocks[b].is_compound() {
            leak_check(cfg, b);
        }
    }
}

// Simplification. The first walk indexes every node address (duplicates are
// a decompiler bug), the second classifies each surviving Jmp against its
// continuation and enclosing loop, and the third marks goto targets so the
// printer can emit labels.

fn collect_addresses(nodes: &[MesAstNode], set: &mut HashMap<u32, ()>) -> Result<()> {
    for node in nodes {
        if node.address != SYNTHETIC_ADDRESS {
            if set.insert(node.address, ()).is_some() {
                bail!("multiple AST nodes at address 0x{:08x}", node.address);
            }
        }
        match &node.kind {
            MesAstKind::Cond {
                consequent,
                alternative,
                ..
            } => {
                collect_addresses(consequent, set)?;
                collect_addresses(alternative, set)?;
            }
            MesAstKind::Loop { body, .. }
            | MesAstKind::Procedure { body, .. }
            | MesAstKind::MenuEntry { body, .. } => collect_addresses(body, set)?,
            MesAstKind::Statements(_) | MesAstKind::Continue | MesAstKind::Break => {}
        }
    }
    Ok(())
}

fn simplify_node(
    node: &mut MesAstNode,
    continuation: Option<u32>,
    loop_head: Option<u32>,
    loop_break: Option<u32>,
    addresses: &HashMap<u32, ()>,
    goto_targets: &mut HashSet<u32>,
) -> Result<()> {
    let node_address = node.address;
    match &mut node.kind {
        MesAstKind::Statements(stmts) => {
            let last_op = match stmts.last() {
                Some(stmt) => stmt.kind.op(),
                None => return Ok(()),
            };
            if last_op == StmtOp::Jmp {
                ensure!(stmts.len() == 1, "jump in the middle of a statement node");
                let addr = stmts[0].kind.target_addr().unwrap();
                if continuation == Some(addr) {
                    // Jump to wherever we were going anyway.
                    stmts.pop();
                } else if loop_head == Some(addr) {
                    node.kind = MesAstKind::Continue;
                } else if loop_break == Some(addr) {
                    node.kind = MesAstKind::Break;
                } else {
                    ensure!(
                        addresses.contains_key(&addr),
                        "goto target 0x{:08x} matches no AST node",
                        addr
                    );
                    goto_targets.insert(addr);
                }
            } else if last_op == StmtOp::End && continuation.is_none() {
                // Return at the end of its scope is implicit.
                stmts.pop();
            }
        }
        MesAstKind::Cond {
            consequent,
            alternative,
            ..
        } => {
            simplify_block(
                consequent,
                continuation,
                loop_head,
                loop_break,
                addresses,
                goto_targets,
            )?;
            simplify_block(
                alternative,
                continuation,
                loop_head,
                loop_break,
                addresses,
                goto_targets,
            )?;
        }
        MesAstKind::Loop { body, .. } => {
            simplify_block(
                body,
                Some(node_address),
                Some(node_address),
                continuation,
                addresses,
                goto_targets,
            )?;
        }
        MesAstKind::Procedure { body, .. } | MesAstKind::MenuEntry { body, .. } => {
            simplify_block(body, None, None, None, addresses, goto_targets)?;
        }
        MesAstKind::Continue | MesAstKind::Break => {}
    }
    Ok(())
}

fn simplify_block(
    nodes: &mut [MesAstNode],
    continuation: Option<u32>,
    loop_head: Option<u32>,
    loop_break: Option<u32>,
    addresses: &HashMap<u32, ()>,
    goto_targets: &mut HashSet<u32>,
) -> Result<()> {
    for i in 0..nodes.len() {
        let next = if i + 1 < nodes.len() {
            Some(nodes[i + 1].address)
        } else {
            continuation
        };
        simplify_node(
            &mut nodes[i],
            next,
            loop_head,
            loop_break,
            addresses,
            goto_targets,
        )?;
    }
    Ok(())
}

fn mark_goto_targets(nodes: &mut [MesAstNode], goto_targets: &HashSet<u32>) {
    for node in nodes {
        if node.address != SYNTHETIC_ADDRESS && goto_targets.contains(&node.address) {
            node.is_goto_target = true;
        }
        match &mut node.kind {
            MesAstKind::Cond {
                consequent,
                alternative,
                ..
            } => {
                mark_goto_targets(consequent, goto_targets);
                mark_goto_targets(alternative, goto_targets);
            }
            MesAstKind::Loop { body, .. }
            | MesAstKind::Procedure { body, .. }
            | MesAstKind::MenuEntry { body, .. } => mark_goto_targets(body, goto_targets),
            MesAstKind::Statements(_) | MesAstKind::Continue | MesAstKind::Break => {}
        }
    }
}

fn ast_simplify(nodes: &mut Vec<MesAstNode>) -> Result<()> {
    let mut addresses = HashMap::new();
    collect_addresses(nodes, &mut addresses)?;
    let mut goto_targets = HashSet::new();
    simplify_block(nodes, None, None, None, &addresses, &mut goto_targets)?;
    mark_goto_targets(nodes, &goto_targets);
    Ok(())
}

/// Decompile a .mes image into the structured AST.
pub fn decompile(ctx: &GameContext, data: &[u8]) -> Result<Vec<MesAstNode>> {
    let statements = parse_statements(ctx, data)?;
    let mut cfg = build_cfg(ctx, statements)?;
    let mut ast = ast_create(ctx, &mut cfg)?;
    leak_check(&cfg, cfg.toplevel);
    ast_simplify(&mut ast)?;
    Ok(ast)
}

/// Stop after CFG construction; used by the block/tree debug dumps.
pub fn decompile_blocks(ctx: &GameContext, data: &[u8]) -> Result<MesCfg> {
    let statements = parse_statements(ctx, data)?;
    build_cfg(ctx, statements)
}
