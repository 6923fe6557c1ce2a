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

// Symbolic names for the engine's system variables and syscalls. The same
// tables drive the printer and the .smes parser, so the two stay inverse
// by construction. Indices and names were recovered from the engine
// binaries; unknown slots fall back to numeric forms.

use crate::{MesExpression, MesParameter};
use anyhow::{anyhow, bail, Result};

pub const NR_SYSTEM_VARIABLES: usize = 26;

static SYSTEM_VAR16_NAMES: [Option<&str>; NR_SYSTEM_VARIABLES] = {
    let mut t: [Option<&str>; NR_SYSTEM_VARIABLES] = [None; NR_SYSTEM_VARIABLES];
    t[2] = Some("flags");
    t[5] = Some("text_home_x");
    t[6] = Some("text_home_y");
    t[7] = Some("width");
    t[8] = Some("height");
    t[9] = Some("text_cursor_x");
    t[10] = Some("text_cursor_y");
    t[12] = Some("font_width");
    t[13] = Some("font_height");
    t[15] = Some("font_width2");
    t[16] = Some("font_height2");
    t[23] = Some("mask_color");
    t
};

static SYSTEM_VAR32_NAMES: [Option<&str>; NR_SYSTEM_VARIABLES] = {
    let mut t: [Option<&str>; NR_SYSTEM_VARIABLES] = [None; NR_SYSTEM_VARIABLES];
    t[0] = Some("memory");
    t[5] = Some("palette");
    t[7] = Some("file_data");
    t[8] = Some("menu_entry_addresses");
    t[9] = Some("menu_entry_numbers");
    t
};

pub fn system_var16_name(no: u32) -> Option<&'static str> {
    SYSTEM_VAR16_NAMES.get(no as usize).copied().flatten()
}

pub fn system_var32_name(no: u32) -> Option<&'static str> {
    SYSTEM_VAR32_NAMES.get(no as usize).copied().flatten()
}

/// Resolve a symbolic system-variable name back to (index, is_dword).
pub fn resolve_sysvar(name: &str) -> Option<(u8, bool)> {
    for i in 0..NR_SYSTEM_VARIABLES {
        if SYSTEM_VAR16_NAMES[i] == Some(name) {
            return Some((i as u8, false));
        }
        if SYSTEM_VAR32_NAMES[i] == Some(name) {
            return Some((i as u8, true));
        }
    }
    None
}

/// One level of the syscall name tree. `group` entries consume their first
/// parameter as a sub-function selector.
pub(crate) struct SyscallEntry {
    pub no: u8,
    pub name: Option<&'static str>,
    pub group: bool,
    pub children: &'static [(u8, &'static str)],
}

static SYSCALLS: &[SyscallEntry] = &[
    SyscallEntry {
        no: 0,
        name: Some("set_font_size"),
        group: false,
        children: &[],
    },
    SyscallEntry {
        no: 2,
        name: Some("Cursor"),
        group: true,
        children: &[
            (0, "load"),
            (1, "refresh"),
            (2, "save_pos"),
            (3, "set_pos"),
            (4, "open"),
        ],
    },
    SyscallEntry {
        no: 3,
        name: None,
        group: true,
        children: &[],
    },
    SyscallEntry {
        no: 4,
        name: Some("SaveData"),
        group: true,
        children: &[
            (1, "save"),
            (2, "load"),
            (3, "save_except_mes_name"),
            (4, "load_var4"),
            (5, "write_var4"),
            (6, "save_union_var4"),
            (7, "load_var4_slice"),
            (8, "save_var4_slice"),
            (9, "copy"),
            (13, "set_mes_name"),
        ],
    },
    SyscallEntry {
        no: 5,
        name: Some("Audio"),
        group: true,
        children: &[],
    },
    SyscallEntry {
        no: 7,
        name: Some("File"),
        group: true,
        children: &[(0, "read"), (1, "write")],
    },
    SyscallEntry {
        no: 8,
        name: Some("load_image"),
        group: false,
        children: &[],
    },
    SyscallEntry {
        no: 9,
        name: Some("Palette"),
        group: true,
        children: &[],
    },
    SyscallEntry {
        no: 10,
        name: Some("Image"),
        group: true,
        children: &[],
    },
    SyscallEntry {
        no: 12,
        name: Some("set_text_colors"),
        group: false,
        children: &[],
    },
    SyscallEntry {
        no: 13,
        name: Some("farcall"),
        group: false,
        children: &[],
    },
    SyscallEntry {
        no: 16,
        name: Some("get_time"),
        group: false,
        children: &[],
    },
    SyscallEntry {
        no: 17,
        name: Some("noop"),
        group: false,
        children: &[],
    },
    SyscallEntry {
        no: 19,
        name: None,
        group: true,
        children: &[],
    },
    SyscallEntry {
        no: 20,
        name: Some("noop2"),
        group: false,
        children: &[],
    },
    SyscallEntry {
        no: 21,
        name: Some("strlen"),
        group: false,
        children: &[],
    },
    SyscallEntry {
        no: 22,
        name: None,
        group: true,
        children: &[],
    },
];

pub(crate) fn syscall_entry(no: u32) -> Option<&'static SyscallEntry> {
    SYSCALLS.iter().find(|e| u32::from(e.no) == no)
}

pub(crate) fn syscall_child_name(entry: &SyscallEntry, no: u32) -> Option<&'static str> {
    entry
        .children
        .iter()
        .find(|&&(n, _)| u32::from(n) == no)
        .map(|&(_, name)| name)
}

/// A dotted name as written in .smes: identifiers mixed with `function[n]`
/// selectors.
#[derive(Clone, Debug)]
pub enum QnamePart {
    Ident(String),
    Number(u32),
}

/// Resolve a `System.A.b` style qualified name to a syscall number plus the
/// selector parameters that the name encodes, exactly inverting the
/// printer's symbolic forms.
pub fn resolve_syscall(parts: &[QnamePart]) -> Result<(u8, Vec<MesParameter>)> {
    let first = parts.first().ok_or_else(|| anyhow!("empty System call"))?;
    let entry = match first {
        QnamePart::Number(no) => syscall_entry(*no),
        QnamePart::Ident(name) => SYSCALLS.iter().find(|e| e.name == Some(name.as_str())),
    };
    let (no, entry) = match (first, entry) {
        (_, Some(entry)) => (entry.no, Some(entry)),
        (QnamePart::Number(no), None) => {
            if *no > 0xff {
                bail!("invalid System call number: {}", no);
            }
            (*no as u8, None)
        }
        (QnamePart::Ident(name), None) => bail!("invalid System call: {}", name),
    };

    let mut params = Vec::new();
    for (i, part) in parts.iter().enumerate().skip(1) {
        let number = match part {
            QnamePart::Number(n) => *n,
            QnamePart::Ident(name) => match (i, entry) {
                (1, Some(entry)) => match entry
                    .children
                    .iter()
                    .find(|&&(_, n)| n == name.as_str())
                {
                    Some(&(n, _)) => u32::from(n),
                    None => bail!("invalid System call: unknown member {}", name),
                },
                _ => bail!("invalid System call: unknown member {}", name),
            },
        };
        params.push(MesParameter::Expr(MesExpression::imm(number)));
    }
    Ok((no, params))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysvar_names_round_trip() {
        assert_eq!(system_var16_name(7), Some("width"));
        assert_eq!(system_var32_name(5), Some("palette"));
        assert_eq!(resolve_sysvar("width"), Some((7, false)));
        assert_eq!(resolve_sysvar("palette"), Some((5, true)));
        assert_eq!(resolve_sysvar("no_such_var"), None);
    }

    #[test]
    fn resolves_nested_syscall() -> Result<()> {
        let parts = vec![
            QnamePart::Ident("Cursor".into()),
            QnamePart::Ident("load".into()),
        ];
        let (no, params) = resolve_syscall(&parts)?;
        assert_eq!(no, 2);
        assert_eq!(params, vec![MesParameter::Expr(MesExpression::Imm8(0))]);
        Ok(())
    }

    #[test]
    fn resolves_numeric_selectors() -> Result<()> {
        let parts = vec![QnamePart::Number(19), QnamePart::Number(3)];
        let (no, params) = resolve_syscall(&parts)?;
        assert_eq!(no, 19);
        assert_eq!(params.len(), 1);
        Ok(())
    }

    #[test]
    fn rejects_unknown_names() {
        let parts = vec![QnamePart::Ident("Mouse".into())];
        assert!(resolve_syscall(&parts).is_err());
    }
}
