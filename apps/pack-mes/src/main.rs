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
use anyhow::{anyhow, Result};
use mes::{
    pack_statements, parse_smes, parse_statements, parse_text_subs, substitute_text, Game,
    GameContext,
};
use std::{fs, path::PathBuf};
use structopt::StructOpt;

/// MES script compiler and text substituter
#[derive(Debug, StructOpt)]
struct Opt {
    /// Target game (selects the opcode tables)
    #[structopt(short, long, default_value = "elf-classics")]
    game: String,

    /// The .mes file to write
    #[structopt(short, long, default_value = "out.mes")]
    output: PathBuf,

    /// Treat the input as a text-substitution file applied to --base
    #[structopt(short, long)]
    text: bool,

    /// Base .mes file for --text mode
    #[structopt(long)]
    base: Option<PathBuf>,

    /// The .smes (or substitution) file to compile
    #[structopt()]
    input: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

    let ctx = GameContext::for_game(Game::from_name(&opt.game)?);

    let statements = if opt.text {
        let base = opt
            .base
            .ok_or_else(|| anyhow!("--text mode needs a --base .mes file"))?;
        let statements = parse_statements(ctx, &fs::read(&base)?)?;
        let subs = parse_text_subs(&fs::read_to_string(&opt.input)?)?;
        substitute_text(ctx, &statements, subs)?
    } else {
        parse_smes(ctx, &fs::read_to_string(&opt.input)?)?
    };

    fs::write(&opt.output, pack_statements(ctx, &statements)?)?;
    Ok(())
}
