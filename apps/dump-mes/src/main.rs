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
use anyhow::Result;
use mes::{
    decompile, decompile_blocks, parse_statements, print_ast, print_block_tree, print_blocks,
    print_flat_statements, print_text_template, Game, GameContext,
};
use std::{fs, path::PathBuf};
use structopt::StructOpt;

/// MES script decompiler
#[derive(Debug, StructOpt)]
struct Opt {
    /// Target game (selects the opcode tables)
    #[structopt(short, long, default_value = "elf-classics")]
    game: String,

    /// Write here instead of stdout
    #[structopt(short, long)]
    output: Option<PathBuf>,

    /// Dump the flat statement list instead of structured code
    #[structopt(long)]
    flat: bool,

    /// Dump the basic-block structure of the CFG
    #[structopt(long)]
    blocks: bool,

    /// Dump the block nesting tree
    #[structopt(long)]
    tree: bool,

    /// Emit a text-substitution template
    #[structopt(short, long)]
    text: bool,

    /// The .mes file to decompile
    #[structopt()]
    input: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

    let ctx = GameContext::for_game(Game::from_name(&opt.game)?);
    let data = fs::read(&opt.input)?;

    let out = if opt.flat {
        print_flat_statements(&parse_statements(ctx, &data)?)
    } else if opt.blocks {
        print_blocks(&decompile_blocks(ctx, &data)?)
    } else if opt.tree {
        print_block_tree(&decompile_blocks(ctx, &data)?)
    } else if opt.text {
        print_text_template(&parse_statements(ctx, &data)?)
    } else {
        print_ast(&decompile(ctx, &data)?)
    };

    match opt.output {
        Some(path) => fs::write(path, out)?,
        None => print!("{}", out),
    }
    Ok(())
}
