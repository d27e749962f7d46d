use std::collections::HashSet;
use std::fs;
use std::io::Seek;
use std::io::SeekFrom;
use std::path::Path;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Error;
use clap::{App, Arg, SubCommand};
use wfs::Volume;
use wfs::WfsError;

fn open_volume(file: &str) -> Result<Volume<fs::File>, Error> {
    let mut reader = fs::File::open(file).with_context(|| anyhow!("opening '{}'", file))?;
    // volumes are addressed by absolute offset; a store that cannot be
    // positioned (a pipe, say) fails here, not somewhere mid-parse
    reader
        .seek(SeekFrom::Start(0))
        .map_err(|_| WfsError::SeekFailed { offset: 0 })
        .with_context(|| anyhow!("probing '{}'", file))?;
    Volume::new(reader).with_context(|| anyhow!("while parsing '{}'", file))
}

fn info(file: &str) -> Result<(), Error> {
    let volume = open_volume(file)?;
    print!("{}", volume.report());
    Ok(())
}

fn chains(file: &str) -> Result<(), Error> {
    let volume = open_volume(file)?;

    for (_, chain) in volume.valid_chains() {
        println!("video chain:");
        print!("{}", volume.chain_tree(chain));
    }
    for (_, chain) in volume.incomplete_chains() {
        println!("recovered video chain:");
        print!("{}", volume.chain_tree(chain));
    }
    Ok(())
}

fn export(file: &str, out_dir: &str) -> Result<(), Error> {
    let volume = open_volume(file)?;
    fs::create_dir_all(out_dir).with_context(|| anyhow!("creating '{}'", out_dir))?;

    let mut covered = HashSet::new();
    let mut exported = 0u64;
    for (slot, chain) in volume.valid_chains().chain(volume.incomplete_chains()) {
        covered.extend(chain.fragments.values().copied());
        let path = Path::new(out_dir).join(format!("chain_main_desc_{}.dav", slot));
        let sink = fs::File::create(&path)
            .with_context(|| anyhow!("creating '{}'", path.display()))?;
        let written = volume
            .export_chain(chain, sink)
            .with_context(|| anyhow!("exporting chain {}", slot))?;
        println!("{} ({} bytes)", path.display(), written);
        exported += 1;
    }

    // whatever no chain covers still holds one fragment each
    let mut strays = 0u64;
    for (slot, sec) in volume.secondaries() {
        if covered.contains(&slot) {
            continue;
        }
        let path = Path::new(out_dir).join(format!(
            "main_desc_{}_sec_desc_{}.dav",
            sec.main_index, slot
        ));
        let sink = fs::File::create(&path)
            .with_context(|| anyhow!("creating '{}'", path.display()))?;
        let written = volume
            .export_secondary(sec, sink)
            .with_context(|| anyhow!("exporting fragment {}", slot))?;
        println!("{} ({} bytes)", path.display(), written);
        strays += 1;
    }

    println!("{} chains and {} single fragments exported", exported, strays);
    Ok(())
}

fn main() -> Result<(), Error> {
    env_logger::init();

    let image_arg = Arg::with_name("image").required(true);

    let matches = App::new("wfstool")
        .setting(clap::AppSettings::SubcommandRequiredElseHelp)
        .subcommand(SubCommand::with_name("info").arg(&image_arg))
        .subcommand(SubCommand::with_name("chains").arg(&image_arg))
        .subcommand(
            SubCommand::with_name("export")
                .arg(&image_arg)
                .arg(Arg::with_name("outdir").required(true)),
        )
        .get_matches();

    match matches.subcommand() {
        ("info", Some(matches)) => info(matches.value_of("image").unwrap()),
        ("chains", Some(matches)) => chains(matches.value_of("image").unwrap()),
        ("export", Some(matches)) => export(
            matches.value_of("image").unwrap(),
            matches.value_of("outdir").unwrap(),
        ),
        (_, _) => unreachable!(),
    }
}
