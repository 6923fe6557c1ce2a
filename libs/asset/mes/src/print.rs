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

// Renderers for the decompiled forms: the structured .smes output, the
// flat labeled listing, and the CFG debug dumps. Everything this module
// emits must re-lex through smes.rs; the precedence table below is the
// other half of that contract.

use crate::{
    cfg::{MesBlockKind, MesCfg},
    system::{syscall_child_name, syscall_entry},
    system_var16_name, system_var32_name, BinaryOp, BlockId, MesAstKind, MesAstNode,
    MesExpression, MesParameter, MesStatement, MesStatementKind, MesText,
};
use log::warn;
use std::fmt::Write;

fn indent_print(out: &mut String, indent: usize) {
    for _ in 0..indent {
        out.push('\t');
    }
}

// Values that read like bit masks print as hex: powers of two and
// all-ones runs at or above 0xFF.
fn print_number(out: &mut String, n: u32) {
    if n < 255 {
        write!(out, "{}", n).unwrap();
    } else if n & (n.wrapping_sub(1)) == 0 || n.wrapping_add(1) & n == 0 {
        write!(out, "0x{:x}", n).unwrap();
    } else {
        write!(out, "{}", n).unwrap();
    }
}

/// Does `sub` need parentheses as an operand of `op`? One precedence class
/// per row: mul/div/mod bind tightest, then add/sub, then comparisons,
/// then the bitwise operators, then && and ||.
fn parens_required(op: BinaryOp, sub: &MesExpression) -> bool {
    let sub_op = match sub {
        MesExpression::Binary { op, .. } => *op,
        _ => return false,
    };
    use BinaryOp::*;
    match op {
        Mul | Div | Mod => true,
        Add | Sub => !matches!(sub_op, Mul | Div | Mod),
        Lt | Gt | Lte | Gte | Eq | Neq => !matches!(sub_op, Add | Sub | Mul | Div | Mod),
        BitAnd | BitIor | BitXor => true,
        LogAnd | LogOr => matches!(sub_op, LogAnd | LogOr),
    }
}

fn binary_operand_print(out: &mut String, op: BinaryOp, sub: &MesExpression) {
    if parens_required(op, sub) {
        out.push('(');
        expression_print(out, sub);
        out.push(')');
    } else {
        expression_print(out, sub);
    }
}

fn imm8_name(index: &MesExpression, names: fn(u32) -> Option<&'static str>) -> Option<&'static str> {
    match index {
        MesExpression::Imm8(v) => names(u32::from(*v)),
        _ => None,
    }
}

pub(crate) fn expression_print(out: &mut String, expr: &MesExpression) {
    match expr {
        MesExpression::Imm8(v) => print_number(out, u32::from(*v)),
        MesExpression::Imm16(v) => print_number(out, u32::from(*v)),
        MesExpression::Imm32(v) => print_number(out, *v),
        MesExpression::GetVar16(n) => {
            write!(out, "var16[{}]", n).unwrap();
        }
        MesExpression::GetVar32(n) => {
            write!(out, "var32[{}]", n).unwrap();
        }
        MesExpression::GetFlagConst(n) => {
            write!(out, "var4[{}]", n).unwrap();
        }
        MesExpression::GetFlagExpr(index) => {
            out.push_str("var4[");
            expression_print(out, index);
            out.push(']');
        }
        MesExpression::Ptr16Get8 { var_no, index } => {
            write!(out, "var16[{}]->byte[", var_no).unwrap();
            expression_print(out, index);
            out.push(']');
        }
        MesExpression::Ptr16Get16 { var_no, index } => {
            // Pointer 0 is the system variable segment.
            if *var_no == 0 {
                if let Some(name) = imm8_name(index, system_var16_name) {
                    write!(out, "System.{}", name).unwrap();
                } else {
                    out.push_str("System.var16[");
                    expression_print(out, index);
                    out.push(']');
                }
            } else {
                write!(out, "var16[{}]->word[", i32::from(*var_no) - 1).unwrap();
                expression_print(out, index);
                out.push(']');
            }
        }
        MesExpression::Ptr32Get8 { var_no, index } => {
            write!(out, "var32[{}]->byte[", i32::from(*var_no) - 1).unwrap();
            expression_print(out, index);
            out.push(']');
        }
        MesExpression::Ptr32Get16 { var_no, index } => {
            write!(out, "var32[{}]->word[", i32::from(*var_no) - 1).unwrap();
            expression_print(out, index);
            out.push(']');
        }
        MesExpression::Ptr32Get32 { var_no, index } => {
            if *var_no == 0 {
                if let Some(name) = imm8_name(index, system_var32_name) {
                    write!(out, "System.{}", name).unwrap();
                } else {
                    out.push_str("System.var32[");
                    expression_print(out, index);
                    out.push(']');
                }
            } else {
                write!(out, "var32[{}]->dword[", i32::from(*var_no) - 1).unwrap();
                expression_print(out, index);
                out.push(']');
            }
        }
        MesExpression::Rand(limit) => {
            out.push_str("rand(");
            expression_print(out, limit);
            out.push(')');
        }
        MesExpression::Binary { op, lhs, rhs } => {
            binary_operand_print(out, *op, lhs);
            write!(out, " {} ", op.token()).unwrap();
            binary_operand_print(out, *op, rhs);
        }
    }
}

fn expression_list_print(out: &mut String, exprs: &[MesExpression]) {
    for (i, e) in exprs.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        expression_print(out, e);
    }
}

fn parameter_print(out: &mut String, param: &MesParameter) {
    match param {
        MesParameter::Str(s) => {
            write!(out, "\"{}\"", s).unwrap();
        }
        MesParameter::Expr(e) => expression_print(out, e),
    }
}

fn parameter_list_print_from(out: &mut String, params: &[MesParameter], start: usize) {
    out.push('(');
    for (i, p) in params.iter().enumerate().skip(start) {
        if i > start {
            out.push(',');
        }
        parameter_print(out, p);
    }
    out.push(')');
}

fn parameter_list_print(out: &mut String, params: &[MesParameter]) {
    parameter_list_print_from(out, params, 0);
}

fn int_parameter(params: &[MesParameter], i: usize) -> Option<u32> {
    match params.get(i) {
        Some(MesParameter::Expr(MesExpression::Imm8(v))) => Some(u32::from(*v)),
        _ => None,
    }
}

// System calls print through the name tree; anything the tree does not
// know keeps its numeric form.
fn sys_print(out: &mut String, expr: &MesExpression, params: &[MesParameter]) {
    let no = match expr {
        MesExpression::Imm8(v) => u32::from(*v),
        _ => {
            out.push_str("System.function[");
            expression_print(out, expr);
            out.push(']');
            parameter_list_print(out, params);
            out.push_str(";\n");
            return;
        }
    };
    match syscall_entry(no) {
        Some(entry) if !entry.group => {
            write!(out, "System.{}", entry.name.unwrap()).unwrap();
            parameter_list_print(out, params);
        }
        Some(entry) if entry.group => {
            let cmd = match int_parameter(params, 0) {
                Some(cmd) => cmd,
                None => {
                    write!(out, "System.function[{}]", no).unwrap();
                    parameter_list_print(out, params);
                    out.push_str(";\n");
                    return;
                }
            };
            match entry.name {
                Some(name) => write!(out, "System.{}", name).unwrap(),
                None => write!(out, "System.function[{}]", no).unwrap(),
            }
            match syscall_child_name(entry, cmd) {
                Some(child) => write!(out, ".{}", child).unwrap(),
                None => write!(out, ".function[{}]", cmd).unwrap(),
            }
            parameter_list_print_from(out, params, 1);
        }
        _ => {
            warn!("unknown System call code: {}", no);
            write!(out, "System.function[{}]", no).unwrap();
            parameter_list_print(out, params);
        }
    }
    out.push_str(";\n");
}

fn text_statement_print(out: &mut String, t: &MesText) {
    if t.unprefixed {
        out.push_str("unprefixed ");
    }
    if !t.terminated {
        out.push_str("unterminated ");
    }
    write!(out, "\"{}\";\n", t.text).unwrap();
}

fn assignment_print(out: &mut String, vals: &[MesExpression]) {
    out.push_str(" = ");
    expression_list_print(out, vals);
    out.push_str(";\n");
}

fn statement_print_inner(out: &mut String, stmt: &MesStatement, indent: usize) {
    indent_print(out, indent);
    match &stmt.kind {
        MesStatementKind::End => out.push_str("return;\n"),
        MesStatementKind::Txt(t) | MesStatementKind::Str(t) => text_statement_print(out, t),
        MesStatementKind::SetFlagConst { var_no, vals } => {
            write!(out, "var4[{}]", var_no).unwrap();
            assignment_print(out, vals);
        }
        MesStatementKind::SetFlagExpr { var_expr, vals } => {
            out.push_str("var4[");
            expression_print(out, var_expr);
            out.push(']');
            assignment_print(out, vals);
        }
        MesStatementKind::SetVar16 { var_no, vals } => {
            write!(out, "var16[{}]", var_no).unwrap();
            assignment_print(out, vals);
        }
        MesStatementKind::SetVar32 { var_no, vals } => {
            write!(out, "var32[{}]", var_no).unwrap();
            assignment_print(out, vals);
        }
        MesStatementKind::Ptr16Set8 { var_no, off, vals } => {
            write!(out, "var16[{}]->byte[", var_no).unwrap();
            expression_print(out, off);
            out.push(']');
            assignment_print(out, vals);
        }
        MesStatementKind::Ptr16Set16 { var_no, off, vals } => {
            if *var_no == 0 {
                if let Some(name) = imm8_name(off, system_var16_name) {
                    write!(out, "System.{}", name).unwrap();
                } else {
                    out.push_str("System.var16[");
                    expression_print(out, off);
                    out.push(']');
                }
            } else {
                write!(out, "var16[{}]->word[", i32::from(*var_no) - 1).unwrap();
                expression_print(out, off);
                out.push(']');
            }
            assignment_print(out, vals);
        }
        MesStatementKind::Ptr32Set8 { var_no, off, vals } => {
            write!(out, "var32[{}]->byte[", var_no).unwrap();
            expression_print(out, off);
            out.push(']');
            assignment_print(out, vals);
        }
        MesStatementKind::Ptr32Set16 { var_no, off, vals } => {
            write!(out, "var32[{}]->word[", var_no).unwrap();
            expression_print(out, off);
            out.push(']');
            assignment_print(out, vals);
        }
        MesStatementKind::Ptr32Set32 { var_no, off, vals } => {
            if *var_no == 0 {
                if let Some(name) = imm8_name(off, system_var32_name) {
                    write!(out, "System.{}", name).unwrap();
                } else {
                    out.push_str("System.var32[");
                    expression_print(out, off);
                    out.push(']');
                }
            } else {
                write!(out, "var32[{}]->dword[", i32::from(*var_no) - 1).unwrap();
                expression_print(out, off);
                out.push(']');
            }
            assignment_print(out, vals);
        }
        MesStatementKind::Jz { cond, addr } => {
            out.push_str("jz ");
            expression_print(out, cond);
            write!(out, " L_{:08x};\n", addr).unwrap();
        }
        MesStatementKind::Jmp { addr } => {
            write!(out, "goto L_{:08x};\n", addr).unwrap();
        }
        MesStatementKind::Sys { expr, params } => sys_print(out, expr, params),
        MesStatementKind::JmpMes(params) => {
            out.push_str("jump");
            parameter_list_print(out, params);
            out.push_str(";\n");
        }
        MesStatementKind::CallMes(params) | MesStatementKind::CallProc(params) => {
            out.push_str("call");
            parameter_list_print(out, params);
            out.push_str(";\n");
        }
        MesStatementKind::Util(params) => {
            out.push_str("util");
            parameter_list_print(out, params);
            out.push_str(";\n");
        }
        MesStatementKind::DefMenu { params, skip_addr } => {
            out.push_str("defmenu");
            parameter_list_print(out, params);
            write!(out, " L_{:08x};\n", skip_addr).unwrap();
        }
        MesStatementKind::DefProc { no_expr, skip_addr } => {
            out.push_str("defproc ");
            expression_print(out, no_expr);
            write!(out, " L_{:08x};\n", skip_addr).unwrap();
        }
        MesStatementKind::MenuExec(_) => out.push_str("menuexec;\n"),
        MesStatementKind::Line(arg) => {
            write!(out, "line {};\n", arg).unwrap();
        }
    }
}

/// One statement in the structured syntax, without label handling.
pub fn print_statement(stmt: &MesStatement) -> String {
    let mut out = String::new();
    statement_print_inner(&mut out, stmt, 0);
    out
}

/// The flat listing: every statement in file order, `L_xxxxxxxx:` labels on
/// jump targets. Unlike the structured output this is loss-free.
pub fn print_flat_statements(statements: &[MesStatement]) -> String {
    let mut out = String::new();
    for stmt in statements {
        if stmt.is_jump_target {
            write!(out, "L_{:08x}:\n", stmt.address).unwrap();
        }
        statement_print_inner(&mut out, stmt, 1);
    }
    out
}

// AST printing. Adjacent text statements fuse into a single literal, with
// CallProc(n) between them rendered as $n interpolation.

fn is_normal_text(stmt: &MesStatement) -> Option<&MesText> {
    match &stmt.kind {
        MesStatementKind::Txt(t) | MesStatementKind::Str(t)
            if t.terminated && !t.unprefixed =>
        {
            Some(t)
        }
        _ => None,
    }
}

fn statement_list_print(out: &mut String, statements: &[MesStatement], indent: usize) {
    let mut text: Option<String> = None;
    for (i, stmt) in statements.iter().enumerate() {
        let next = statements.get(i + 1);
        if let Some(t) = is_normal_text(stmt) {
            text.get_or_insert_with(String::new).push_str(&t.text);
            continue;
        }
        if let (Some(buf), MesStatementKind::CallProc(params), Some(next)) =
            (&mut text, &stmt.kind, next)
        {
            if is_normal_text(next).is_some() {
                if let Some(f) = int_parameter(params, 0) {
                    write!(buf, "${}", f).unwrap();
                    continue;
                }
            }
        }
        if let Some(buf) = text.take() {
            indent_print(out, indent);
            write!(out, "\"{}\";\n", buf).unwrap();
        }
        statement_print_inner(out, stmt, indent);
    }
    if let Some(buf) = text.take() {
        indent_print(out, indent);
        write!(out, "\"{}\";\n", buf).unwrap();
    }
}

fn cond_print(
    out: &mut String,
    condition: &MesExpression,
    consequent: &[MesAstNode],
    alternative: &[MesAstNode],
    indent: usize,
) {
    out.push_str("if (");
    expression_print(out, condition);
    out.push_str(") {\n");
    ast_block_print(out, consequent, indent + 1);
    if !alternative.is_empty() {
        indent_print(out, indent);
        if alternative.len() == 1 && !alternative[0].is_goto_target {
            if let MesAstKind::Cond {
                condition,
                consequent,
                alternative,
            } = &alternative[0].kind
            {
                out.push_str("} else ");
                cond_print(out, condition, consequent, alternative, indent);
                return;
            }
        }
        out.push_str("} else {\n");
        ast_block_print(out, alternative, indent + 1);
        indent_print(out, indent);
    } else {
        indent_print(out, indent);
    }
    out.push_str("}\n");
}

fn ast_node_print(out: &mut String, node: &MesAstNode, indent: usize) {
    if node.is_goto_target {
        indent_print(out, indent.saturating_sub(1));
        write!(out, "L_{:08x}:\n", node.address).unwrap();
    }
    match &node.kind {
        MesAstKind::Statements(stmts) => statement_list_print(out, stmts, indent),
        MesAstKind::Cond {
            condition,
            consequent,
            alternative,
        } => {
            indent_print(out, indent);
            cond_print(out, condition, consequent, alternative, indent);
        }
        MesAstKind::Loop { condition, body } => {
            indent_print(out, indent);
            out.push_str("while (");
            expression_print(out, condition);
            out.push_str(") {\n");
            ast_block_print(out, body, indent + 1);
            indent_print(out, indent);
            out.push_str("}\n");
        }
        MesAstKind::Procedure { num_expr, body } => {
            out.push('\n');
            indent_print(out, indent);
            out.push_str("procedure[");
            expression_print(out, num_expr);
            out.push_str("] = {\n");
            ast_block_print(out, body, indent + 1);
            indent_print(out, indent);
            out.push_str("};\n");
        }
        MesAstKind::MenuEntry { params, body } => {
            indent_print(out, indent);
            out.push_str("menu[");
            parameter_list_print(out, params);
            out.push_str("] = {\n");
            ast_block_print(out, body, indent + 1);
            indent_print(out, indent);
            out.push_str("};\n");
        }
        MesAstKind::Continue => {
            indent_print(out, indent);
            out.push_str("continue;\n");
        }
        MesAstKind::Break => {
            indent_print(out, indent);
            out.push_str("break;\n");
        }
    }
}

fn ast_block_print(out: &mut String, nodes: &[MesAstNode], indent: usize) {
    for node in nodes {
        ast_node_print(out, node, indent);
    }
}

/// Render the whole decompiled tree as .smes text.
pub fn print_ast(nodes: &[MesAstNode]) -> String {
    let mut out = String::new();
    ast_block_print(&mut out, nodes, 0);
    out
}

// CFG debug dumps.

fn block_print(out: &mut String, cfg: &MesCfg, id: BlockId, indent: usize) {
    let block = &cfg.blocks[id];
    indent_print(out, indent);
    write!(out, "// -------- {:04} --------\n", block.post).unwrap();
    match &block.kind {
        MesBlockKind::Basic(b) => {
            for stmt in &b.statements {
                statement_print_inner(out, stmt, indent);
            }
            if let Some(end) = &b.end {
                if end.is_jump_target {
                    indent_print(out, indent.saturating_sub(1));
                    write!(out, "L_{:08x}:\n", end.address).unwrap();
                }
                indent_print(out, indent);
                match &end.kind {
                    MesStatementKind::Jz { cond, addr } => {
                        out.push_str("JZ ");
                        expression_print(out, cond);
                        write!(out, " L_{:08x};", addr).unwrap();
                        if let Some(t) = b.jump_target {
                            write!(out, " // {:04}", cfg.blocks[t].post).unwrap();
                        }
                        out.push('\n');
                    }
                    MesStatementKind::Jmp { addr } => {
                        write!(out, "JMP L_{:08x};", addr).unwrap();
                        if let Some(t) = b.jump_target {
                            write!(out, " // {:04}", cfg.blocks[t].post).unwrap();
                        }
                        out.push('\n');
                    }
                    MesStatementKind::End => out.push_str("END;\n"),
                    other => {
                        write!(out, "// unexpected edge: {:?}\n", other.op()).unwrap();
                    }
                }
            }
        }
        MesBlockKind::Compound(c) => {
            indent_print(out, indent);
            let head = c.head.as_ref();
            match head.map(|h| &h.kind) {
                Some(MesStatementKind::DefProc { no_expr, .. }) => {
                    out.push_str("procedure[");
                    expression_print(out, no_expr);
                    out.push_str("] = {\n");
                }
                Some(MesStatementKind::DefMenu { params, .. }) => {
                    out.push_str("menu[");
                    parameter_list_print(out, params);
                    out.push_str("] = {\n");
                }
                _ => out.push_str("{\n"),
            }
            for &child in &c.children {
                block_print(out, cfg, child, indent + 1);
            }
            indent_print(out, indent);
            out.push_str("};\n\n");
        }
    }
}

/// Annotated basic-block listing of the CFG, with post-order numbers.
pub fn print_blocks(cfg: &MesCfg) -> String {
    let mut out = String::new();
    for &child in &cfg.blocks[cfg.toplevel].compound().children {
        let indent = usize::from(!cfg.blocks[child].is_compound());
        block_print(&mut out, cfg, child, indent);
    }
    out
}

fn block_tree_print(out: &mut String, cfg: &MesCfg, id: BlockId, indent: usize) {
    let block = &cfg.blocks[id];
    indent_print(out, indent);
    write!(out, "[{}] ", block.post).unwrap();
    match &block.kind {
        MesBlockKind::Basic(b) => {
            write!(out, "{} STATEMENTS", b.statements.len()).unwrap();
            if let Some(end) = &b.end {
                write!(out, ", {:?}", end.kind.op()).unwrap();
            }
            out.push('\n');
        }
        MesBlockKind::Compound(c) => {
            match c.head.as_ref().map(|h| &h.kind) {
                Some(MesStatementKind::DefProc { no_expr, .. }) => {
                    out.push_str("PROCEDURE ");
                    expression_print(out, no_expr);
                }
                Some(MesStatementKind::DefMenu { params, .. }) => {
                    out.push_str("MENU ENTRY ");
                    parameter_list_print(out, params);
                }
                _ => out.push_str("TOPLEVEL"),
            }
            out.push('\n');
            for &child in &c.children {
                block_tree_print(out, cfg, child, indent + 1);
            }
        }
    }
}

/// Block nesting structure only, one line per block.
pub fn print_block_tree(cfg: &MesCfg) -> String {
    let mut out = String::new();
    for &child in &cfg.blocks[cfg.toplevel].compound().children {
        block_tree_print(&mut out, cfg, child, 0);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{decompile, Game, GameContext};
    use anyhow::Result;

    fn ctx() -> &'static GameContext {
        GameContext::for_game(Game::ElfClassics)
    }

    fn expr_str(expr: &MesExpression) -> String {
        let mut out = String::new();
        expression_print(&mut out, expr);
        out
    }

    #[test]
    fn precedence_drives_parentheses() {
        use MesExpression as E;
        // (1 + 2) * 3 keeps its parens; 1 + 2 * 3 does not need any.
        let sum = E::Binary {
            op: BinaryOp::Add,
            lhs: Box::new(E::Imm8(1)),
            rhs: Box::new(E::Imm8(2)),
        };
        let scaled = E::Binary {
            op: BinaryOp::Mul,
            lhs: Box::new(sum.clone()),
            rhs: Box::new(E::Imm8(3)),
        };
        assert_eq!(expr_str(&scaled), "(1 + 2) * 3");

        let prod = E::Binary {
            op: BinaryOp::Mul,
            lhs: Box::new(E::Imm8(2)),
            rhs: Box::new(E::Imm8(3)),
        };
        let loose = E::Binary {
            op: BinaryOp::Add,
            lhs: Box::new(E::Imm8(1)),
            rhs: Box::new(prod.clone()),
        };
        assert_eq!(expr_str(&loose), "1 + 2 * 3");

        // Comparisons swallow arithmetic but parenthesize everything else.
        let cmp = E::Binary {
            op: BinaryOp::Eq,
            lhs: Box::new(loose),
            rhs: Box::new(E::Imm8(7)),
        };
        assert_eq!(expr_str(&cmp), "1 + 2 * 3 == 7");

        let masked = E::Binary {
            op: BinaryOp::BitAnd,
            lhs: Box::new(prod),
            rhs: Box::new(E::Imm8(0xf)),
        };
        assert_eq!(expr_str(&masked), "(2 * 3) & 15");

        // Modulo sits in the multiplicative class.
        let rem = E::Binary {
            op: BinaryOp::Mod,
            lhs: Box::new(E::Imm8(7)),
            rhs: Box::new(E::Imm8(3)),
        };
        let sum2 = E::Binary {
            op: BinaryOp::Mul,
            lhs: Box::new(E::Imm8(2)),
            rhs: Box::new(rem),
        };
        assert_eq!(expr_str(&sum2), "2 * (7 % 3)");
    }

    #[test]
    fn bitmasks_print_as_hex() {
        assert_eq!(expr_str(&MesExpression::Imm16(0x100)), "0x100");
        assert_eq!(expr_str(&MesExpression::Imm16(0xff)), "0xff");
        assert_eq!(expr_str(&MesExpression::Imm16(300)), "300");
        assert_eq!(expr_str(&MesExpression::Imm8(42)), "42");
    }

    #[test]
    fn system_variables_print_symbolically() {
        let expr = MesExpression::Ptr16Get16 {
            var_no: 0,
            index: Box::new(MesExpression::Imm8(7)),
        };
        assert_eq!(expr_str(&expr), "System.width");
        let expr = MesExpression::Ptr16Get16 {
            var_no: 0,
            index: Box::new(MesExpression::Imm8(24)),
        };
        assert_eq!(expr_str(&expr), "System.var16[24]");
        let expr = MesExpression::Ptr16Get16 {
            var_no: 3,
            index: Box::new(MesExpression::Imm8(0)),
        };
        assert_eq!(expr_str(&expr), "var16[2]->word[0]");
    }

    #[test]
    fn syscalls_print_through_tree() {
        use crate::MesStatement;
        let stmt = MesStatement::new(MesStatementKind::Sys {
            expr: MesExpression::Imm8(2),
            params: vec![
                MesParameter::Expr(MesExpression::Imm8(0)),
                MesParameter::Str("CURSOR1.CUR".into()),
            ],
        });
        assert_eq!(
            print_statement(&stmt),
            "System.Cursor.load(\"CURSOR1.CUR\");\n"
        );
        let stmt = MesStatement::new(MesStatementKind::Sys {
            expr: MesExpression::Imm8(6),
            params: vec![],
        });
        assert_eq!(print_statement(&stmt), "System.function[6]();\n");
    }

    #[test]
    fn prints_structured_conditional() -> Result<()> {
        let bytes = crate::cfg::tests::two_branch_conditional();
        let ast = decompile(ctx(), &bytes)?;
        let text = print_ast(&ast);
        assert!(text.contains("if (var16[0] == 1) {"));
        assert!(text.contains("} else {"));
        assert!(!text.contains("goto"));
        Ok(())
    }

    #[test]
    fn merges_adjacent_text() {
        use crate::MesStatement;
        let stmts = vec![
            MesStatement::new(MesStatementKind::Txt(MesText::new("こん"))),
            MesStatement::new(MesStatementKind::CallProc(vec![MesParameter::Expr(
                MesExpression::Imm8(3),
            )])),
            MesStatement::new(MesStatementKind::Txt(MesText::new("にちは"))),
        ];
        let node = MesAstNode::new(0, MesAstKind::Statements(stmts));
        assert_eq!(print_ast(&[node]), "\"こん$3にちは\";\n");
    }
}
