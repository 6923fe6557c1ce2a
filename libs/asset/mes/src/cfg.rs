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

// Control flow graph over the flat statement list, in five passes:
//
//   1. group procedure/menu definitions into compound blocks
//   2. split each compound's statements into basic blocks
//   3. connect blocks with fallthrough/jump edges
//   4. dominators + dominance frontiers (Cooper/Harvey/Kennedy)
//   5. sanity-check that no jump escapes its compound block
//
// Blocks live in an index arena owned by MesCfg. A statement is owned by
// exactly one block until the AST builder claims it; `in_ast` records the
// transfer so teardown never frees twice.

use crate::{
    game::{GameContext, Vop},
    MesStatement, MesStatementKind,
};
use anyhow::{bail, ensure, Result};
use std::collections::HashMap;

pub type BlockId = usize;

#[derive(Debug, Default)]
pub struct MesBasicBlock {
    pub statements: Vec<MesStatement>,
    /// Outgoing edge statement: Jz, Jmp or End.
    pub end: Option<MesStatement>,
    /// Target of the Jz/Jmp edge.
    pub jump_target: Option<BlockId>,
    /// Textually next block, absent after a Jmp or for a terminal block.
    pub fallthrough: Option<BlockId>,
}

#[derive(Debug, Default)]
pub struct MesCompoundBlock {
    /// The DefProc/DefMenu header; None only for the toplevel.
    pub head: Option<MesStatement>,
    /// Address of the End statement that closes this block (skip_addr - 1).
    pub end_address: u32,
    pub children: Vec<BlockId>,
    /// Next sibling in the parent graph.
    pub next: Option<BlockId>,
    /// Post-order numbering of this compound's subgraph.
    pub post_order: Vec<BlockId>,
}

#[derive(Debug)]
pub enum MesBlockKind {
    Basic(MesBasicBlock),
    Compound(MesCompoundBlock),
}

#[derive(Debug)]
pub struct MesBlock {
    pub parent: Option<BlockId>,
    pub pred: Vec<BlockId>,
    pub succ: Vec<BlockId>,
    pub dom: Vec<BlockId>,
    pub dom_front: Vec<BlockId>,
    /// Post-order number inside the owning compound's subgraph; -1 while
    /// unnumbered or unreachable.
    pub post: i32,
    pub address: u32,
    pub in_ast: bool,
    pub kind: MesBlockKind,
}

impl MesBlock {
    fn new(address: u32, kind: MesBlockKind) -> Self {
        Self {
            parent: None,
            pred: Vec::new(),
            succ: Vec::new(),
            dom: Vec::new(),
            dom_front: Vec::new(),
            post: -1,
            address,
            in_ast: false,
            kind,
        }
    }

    pub fn basic(&self) -> &MesBasicBlock {
        match &self.kind {
            MesBlockKind::Basic(b) => b,
            MesBlockKind::Compound(_) => panic!("expected basic block"),
        }
    }

    pub fn basic_mut(&mut self) -> &mut MesBasicBlock {
        match &mut self.kind {
            MesBlockKind::Basic(b) => b,
            MesBlockKind::Compound(_) => panic!("expected basic block"),
        }
    }

    pub fn compound(&self) -> &MesCompoundBlock {
        match &self.kind {
            MesBlockKind::Compound(c) => c,
            MesBlockKind::Basic(_) => panic!("expected compound block"),
        }
    }

    pub fn compound_mut(&mut self) -> &mut MesCompoundBlock {
        match &mut self.kind {
            MesBlockKind::Compound(c) => c,
            MesBlockKind::Basic(_) => panic!("expected compound block"),
        }
    }

    pub fn is_compound(&self) -> bool {
        matches!(self.kind, MesBlockKind::Compound(_))
    }

    /// Fake entry block the AST builder walks in from; it exists only so
    /// the toplevel gets the same fallthrough treatment as everything else.
    pub(crate) fn synthetic_head(fallthrough: BlockId) -> Self {
        MesBlock::new(
            0,
            MesBlockKind::Basic(MesBasicBlock {
                statements: Vec::new(),
                end: None,
                jump_target: None,
                fallthrough: Some(fallthrough),
            }),
        )
    }
}

pub struct MesCfg {
    pub blocks: Vec<MesBlock>,
    pub toplevel: BlockId,
}

impl MesCfg {
    pub fn block(&self, id: BlockId) -> &MesBlock {
        &self.blocks[id]
    }

    pub(crate) fn alloc(&mut self, block: MesBlock) -> BlockId {
        self.blocks.push(block);
        self.blocks.len() - 1
    }

    fn add_child(&mut self, parent: BlockId, child: BlockId) {
        self.blocks[child].parent = Some(parent);
        self.blocks[parent].compound_mut().children.push(child);
    }

    fn add_edge(&mut self, src: BlockId, dst: BlockId) {
        self.blocks[src].succ.push(dst);
        self.blocks[dst].pred.push(src);
    }
}

pub(crate) fn make_basic_block(
    statements: Vec<MesStatement>,
    end: Option<MesStatement>,
) -> MesBlock {
    let address = match statements.first() {
        Some(stmt) => stmt.address,
        None => end.as_ref().expect("empty basic block with no edge").address,
    };
    MesBlock::new(
        address,
        MesBlockKind::Basic(MesBasicBlock {
            statements,
            end,
            jump_target: None,
            fallthrough: None,
        }),
    )
}

// Pass 1: group statements belonging to procedures/menu entries into
// compound blocks. Statement lists land in provisional basic blocks that
// pass 2 splits up.
fn create_compound_blocks(
    ctx: &GameContext,
    cfg: &mut MesCfg,
    statements: Vec<MesStatement>,
) -> Result<()> {
    if statements.is_empty() {
        return Ok(());
    }

    let last = statements.last().unwrap();
    ensure!(
        ctx.vop(&last.kind) == Vop::End,
        "mes file is not terminated by END statement"
    );
    let toplevel = cfg.toplevel;
    cfg.blocks[toplevel].compound_mut().end_address = last.address;

    let mut stack: Vec<BlockId> = vec![toplevel];
    let mut current: Vec<MesStatement> = Vec::new();

    for stmt in statements {
        let top = match stack.last() {
            Some(&top) => top,
            None => bail!("statements after final END at 0x{:08x}", stmt.address),
        };
        let vop = ctx.vop(&stmt.kind);
        if stmt.address == cfg.blocks[top].compound().end_address {
            // End of the container: the END statement belongs to the block
            // it closes.
            ensure!(
                vop == Vop::End,
                "expected END statement at 0x{:08x}",
                stmt.address
            );
            let closed = stack.pop().unwrap();
            current.push(stmt);
            let block = make_basic_block(std::mem::take(&mut current), None);
            let id = cfg.alloc(block);
            cfg.add_child(closed, id);
        } else if vop == Vop::DefProc || vop == Vop::DefMenu {
            if !current.is_empty() {
                let block = make_basic_block(std::mem::take(&mut current), None);
                let id = cfg.alloc(block);
                cfg.add_child(top, id);
            }
            let end_address = stmt.kind.target_addr().unwrap().wrapping_sub(1);
            let address = stmt.address;
            let block = MesBlock::new(
                address,
                MesBlockKind::Compound(MesCompoundBlock {
                    head: Some(stmt),
                    end_address,
                    children: Vec::new(),
                    next: None,
                    post_order: Vec::new(),
                }),
            );
            let id = cfg.alloc(block);
            cfg.add_child(top, id);
            stack.push(id);
        } else {
            current.push(stmt);
        }
    }

    ensure!(stack.is_empty(), "unterminated procedure or menu entry");
    ensure!(current.is_empty(), "statements left over after final END");
    Ok(())
}

// Pass 2: split the provisional statement lists into real basic blocks: a
// jump target starts a new block, a control-flow statement ends one as its
// outgoing edge.
fn split_into_basic_blocks(ctx: &GameContext, cfg: &mut MesCfg, parent: BlockId) -> Result<()> {
    let children = std::mem::take(&mut cfg.blocks[parent].compound_mut().children);
    for child in children {
        if cfg.blocks[child].is_compound() {
            split_into_basic_blocks(ctx, cfg, child)?;
            cfg.blocks[parent].compound_mut().children.push(child);
            continue;
        }
        let statements = std::mem::take(&mut cfg.blocks[child].basic_mut().statements);
        let mut current: Vec<MesStatement> = Vec::new();
        for stmt in statements {
            if stmt.is_jump_target && !current.is_empty() {
                let block = make_basic_block(std::mem::take(&mut current), None);
                let id = cfg.alloc(block);
                cfg.add_child(parent, id);
            }
            match ctx.vop(&stmt.kind) {
                Vop::Jz | Vop::Jmp | Vop::End => {
                    let block = make_basic_block(std::mem::take(&mut current), Some(stmt));
                    let id = cfg.alloc(block);
                    cfg.add_child(parent, id);
                }
                _ => current.push(stmt),
            }
        }
        if !current.is_empty() {
            let block = make_basic_block(current, None);
            let id = cfg.alloc(block);
            cfg.add_child(parent, id);
        }
    }
    Ok(())
}

fn block_start_address(cfg: &MesCfg, id: BlockId) -> u32 {
    let block = &cfg.blocks[id];
    match &block.kind {
        MesBlockKind::Basic(b) => match b.statements.first() {
            Some(stmt) => stmt.address,
            None => b.end.as_ref().expect("empty basic block").address,
        },
        MesBlockKind::Compound(c) => c.head.as_ref().expect("headless compound").address,
    }
}

fn init_block_table(
    cfg: &MesCfg,
    children: &[BlockId],
    table: &mut HashMap<u32, BlockId>,
) -> Result<()> {
    for &id in children {
        let addr = block_start_address(cfg, id);
        if table.insert(addr, id).is_some() {
            bail!("multiple blocks at address 0x{:08x}", addr);
        }
        if let MesBlockKind::Compound(c) = &cfg.blocks[id].kind {
            init_block_table(cfg, &c.children, table)?;
        }
    }
    Ok(())
}

fn lookup_block(table: &HashMap<u32, BlockId>, addr: u32) -> Result<BlockId> {
    match table.get(&addr) {
        Some(&id) => Ok(id),
        None => bail!("block address lookup failed for 0x{:08x}", addr),
    }
}

// Pass 3: connect the graph. Note that a compound block's interior graph is
// intentionally disconnected from the graph it is a node of.
fn create_edges(
    ctx: &GameContext,
    cfg: &mut MesCfg,
    parent: BlockId,
    table: &HashMap<u32, BlockId>,
) -> Result<()> {
    let children = cfg.blocks[parent].compound().children.clone();
    for (i, &id) in children.iter().enumerate() {
        let next = children.get(i + 1).copied();
        if cfg.blocks[id].is_compound() {
            cfg.blocks[id].compound_mut().next = next;
            if let Some(next) = next {
                cfg.add_edge(id, next);
            }
            create_edges(ctx, cfg, id, table)?;
            continue;
        }
        let end_vop = cfg.blocks[id]
            .basic()
            .end
            .as_ref()
            .map(|stmt| ctx.vop(&stmt.kind));
        match end_vop {
            Some(Vop::Jz) => {
                cfg.blocks[id].basic_mut().fallthrough = next;
                if let Some(next) = next {
                    cfg.add_edge(id, next);
                }
                let addr = cfg.blocks[id]
                    .basic()
                    .end
                    .as_ref()
                    .unwrap()
                    .kind
                    .target_addr()
                    .unwrap();
                let target = lookup_block(table, addr)?;
                cfg.blocks[id].basic_mut().jump_target = Some(target);
                cfg.add_edge(id, target);
            }
            Some(Vop::Jmp) => {
                let addr = cfg.blocks[id]
                    .basic()
                    .end
                    .as_ref()
                    .unwrap()
                    .kind
                    .target_addr()
                    .unwrap();
                let target = lookup_block(table, addr)?;
                cfg.blocks[id].basic_mut().jump_target = Some(target);
                cfg.add_edge(id, target);
            }
            Some(Vop::End) => {} // terminal
            Some(_) => bail!("unexpected statement as block edge"),
            None => {
                cfg.blocks[id].basic_mut().fallthrough = next;
                if let Some(next) = next {
                    cfg.add_edge(id, next);
                }
            }
        }
    }
    Ok(())
}

fn postorder(cfg: &mut MesCfg, id: BlockId, list: &mut Vec<BlockId>) {
    // Temporary marker so a cycle cannot revisit us.
    cfg.blocks[id].post = 9999;
    let succs = cfg.blocks[id].succ.clone();
    for s in succs {
        if cfg.blocks[s].post >= 0 {
            continue;
        }
        postorder(cfg, s, list);
    }
    cfg.blocks[id].post = list.len() as i32;
    list.push(id);
}

fn intersect(doms: &[i32], mut finger1: i32, mut finger2: i32) -> Result<i32> {
    while finger1 != finger2 {
        ensure!(finger1 >= 0 && finger2 >= 0, "dominator intersection failed");
        while finger1 < finger2 {
            finger1 = doms[finger1 as usize];
            ensure!(finger1 >= 0, "dominator intersection failed");
        }
        while finger2 < finger1 {
            finger2 = doms[finger2 as usize];
            ensure!(finger2 >= 0, "dominator intersection failed");
        }
    }
    Ok(finger1)
}

// Pass 4: dominators and dominance frontiers for one compound's subgraph,
// then recursively for nested compounds.
fn compute_dominance(cfg: &mut MesCfg, compound: BlockId) -> Result<()> {
    let children = cfg.blocks[compound].compound().children.clone();
    let start = match children.first() {
        Some(&start) => start,
        None => return Ok(()),
    };

    let mut order: Vec<BlockId> = Vec::new();
    postorder(cfg, start, &mut order);
    let len = order.len();

    let mut doms = vec![-1i32; len];
    doms[cfg.blocks[start].post as usize] = cfg.blocks[start].post;

    let mut changed = true;
    while changed {
        changed = false;
        for &b in &order {
            if b == start {
                continue;
            }
            let b_post = cfg.blocks[b].post as usize;
            let mut new_idom = -1i32;
            for &p in &cfg.blocks[b].pred {
                let p_post = cfg.blocks[p].post;
                if p_post < 0 || doms[p_post as usize] == -1 {
                    continue;
                }
                if new_idom < 0 {
                    new_idom = p_post;
                } else {
                    new_idom = intersect(&doms, p_post, new_idom)?;
                }
            }
            if doms[b_post] != new_idom {
                doms[b_post] = new_idom;
                changed = true;
            }
        }
    }

    // Dominance frontiers via the runner walk from each join point.
    for &b in &order {
        if cfg.blocks[b].pred.len() < 2 {
            continue;
        }
        let b_post = cfg.blocks[b].post;
        for p in cfg.blocks[b].pred.clone() {
            let p_post = cfg.blocks[p].post;
            if p_post < 0 {
                continue;
            }
            let mut runner = p_post;
            while runner != doms[b_post as usize] {
                let runner_block = order[runner as usize];
                if !cfg.blocks[runner_block].dom_front.contains(&b) {
                    cfg.blocks[runner_block].dom_front.push(b);
                }
                runner = doms[runner as usize];
                ensure!(runner >= 0, "dominance frontier walk escaped the graph");
            }
        }
    }

    for &child in &children {
        if cfg.blocks[child].post < 0 {
            continue;
        }
        if cfg.blocks[child].is_compound() {
            compute_dominance(cfg, child)?;
        }
    }

    // Fill the dominated sets by walking each block's dominator chain. The
    // chain stops before the subgraph entry, whose set stays empty.
    for i in 0..len {
        let dominated = order[i];
        let mut j = i as i32;
        while doms[j as usize] != j {
            cfg.blocks[order[j as usize]].dom.push(dominated);
            j = doms[j as usize];
            ensure!(j >= 0, "broken dominator chain");
        }
    }

    cfg.blocks[compound].compound_mut().post_order = order;
    Ok(())
}

// Pass 5: no Jz/Jmp may leave its compound block. A violation here is a
// decompiler bug or a corrupt file, not something to paper over.
fn check_jump(cfg: &MesCfg, stmt: &MesStatement, parent: BlockId) -> Result<()> {
    let addr = match &stmt.kind {
        MesStatementKind::Jz { addr, .. } | MesStatementKind::Jmp { addr } => *addr,
        _ => return Ok(()),
    };
    for &id in &cfg.blocks[parent].compound().children {
        let block = &cfg.blocks[id];
        match &block.kind {
            MesBlockKind::Compound(c) => {
                if addr == c.head.as_ref().expect("headless compound").address {
                    return Ok(());
                }
            }
            MesBlockKind::Basic(b) => {
                let start = block_start_address(cfg, id);
                let end = match &b.end {
                    Some(end) => end.address,
                    None => {
                        b.statements
                            .last()
                            .expect("empty basic block")
                            .next_address
                    }
                };
                if addr >= start && addr <= end {
                    return Ok(());
                }
            }
        }
    }
    bail!(
        "jump escapes local scope at 0x{:08x} -> 0x{:08x}",
        stmt.address,
        addr
    );
}

fn check_block(cfg: &MesCfg, id: BlockId, parent: BlockId) -> Result<()> {
    match &cfg.blocks[id].kind {
        MesBlockKind::Basic(b) => {
            if let Some(end) = &b.end {
                check_jump(cfg, end, parent)?;
            }
        }
        MesBlockKind::Compound(c) => {
            for &child in &c.children {
                check_block(cfg, child, id)?;
            }
        }
    }
    Ok(())
}

/// Build the full CFG for a parsed statement list.
pub fn build_cfg(ctx: &GameContext, statements: Vec<MesStatement>) -> Result<MesCfg> {
    let mut cfg = MesCfg {
        blocks: Vec::new(),
        toplevel: 0,
    };
    let toplevel = cfg.alloc(MesBlock::new(
        0,
        MesBlockKind::Compound(MesCompoundBlock::default()),
    ));
    cfg.toplevel = toplevel;

    create_compound_blocks(ctx, &mut cfg, statements)?;
    split_into_basic_blocks(ctx, &mut cfg, toplevel)?;

    let mut table = HashMap::new();
    let children = cfg.blocks[toplevel].compound().children.clone();
    init_block_table(&cfg, &children, &mut table)?;
    create_edges(ctx, &mut cfg, toplevel, &table)?;

    compute_dominance(&mut cfg, toplevel)?;

    for &child in &cfg.blocks[toplevel].compound().children {
        check_block(&cfg, child, toplevel)?;
    }
    Ok(cfg)
}
