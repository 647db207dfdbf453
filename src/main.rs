use anyhow::{anyhow, Result};
use clap::{arg, command, ArgAction};
use lffs::{map_fs_err, Lffs, LffsOptions, ObjectType};
use log::*;
use nand_driver::{FileNandDriver, NandGeometry};
use std::env::set_var;

fn main() -> Result<()> {
    let matches = command!() // requires `cargo` feature
        .arg(
            arg!(-d --device <FILE> "NAND image path (created when missing)")
                .required(false)
                .default_value("nand.img"),
        )
        .arg(arg!(--format "Format the device").action(ArgAction::SetTrue).required(false))
        .arg(arg!(--check "Run the consistency sweep").action(ArgAction::SetTrue).required(false))
        .arg(arg!(--ls <PATH> "List a directory").required(false))
        .arg(arg!(--cat <PATH> "Print a file's contents").required(false))
        .arg(arg!(--stat <PATH> "Show attributes of a path").required(false))
        .arg(arg!(--blocks <N> "Erase blocks on the device").required(false).default_value("128"))
        .arg(arg!(--chunks <N> "Chunks per block").required(false).default_value("32"))
        .arg(arg!(--bytes <N> "Data bytes per chunk").required(false).default_value("512"))
        .arg(
            arg!(-v --verbose "Print more debug information, or set `RUST_LOG=debug`")
                .action(ArgAction::SetTrue)
                .required(false),
        )
        .get_matches();

    if matches.get_flag("verbose") {
        set_var("RUST_LOG", "debug");
    }
    lffs::utils::init_logs();

    let device = matches.get_one::<String>("device").unwrap();
    let geom = NandGeometry {
        n_blocks: matches.get_one::<String>("blocks").unwrap().parse()?,
        chunks_per_block: matches.get_one::<String>("chunks").unwrap().parse()?,
        data_bytes_per_chunk: matches.get_one::<String>("bytes").unwrap().parse()?,
        spare_bytes_per_chunk: 64,
    };
    info!("device {}: {:?}", device, geom);
    let driver = FileNandDriver::new(device, geom)?;
    let mut fs = map_fs_err(Lffs::new(driver, LffsOptions::default()))?;

    if matches.get_flag("format") {
        map_fs_err(fs.format())?;
        println!("formatted {}", device);
    }
    map_fs_err(fs.mount(device))?;

    if let Some(path) = matches.get_one::<String>("ls") {
        let dir = map_fs_err(fs.resolve_path(path, true))?;
        let mut cursor = 0;
        while let Some((name, id)) = map_fs_err(fs.readdir(dir, cursor))? {
            let attr = map_fs_err(fs.stat(id))?;
            let shown = match attr.obj_type {
                ObjectType::Directory => format!("{}/", name),
                ObjectType::Symlink => {
                    format!("{} -> {}", name, fs.readlink(id).unwrap_or_default())
                }
                _ => name,
            };
            println!("{:>8}  {:o}  {:>10}  {}", attr.id, attr.mode, attr.size, shown);
            cursor += 1;
        }
    }

    if let Some(path) = matches.get_one::<String>("cat") {
        let obj = map_fs_err(fs.resolve_path(path, true))?;
        let attr = map_fs_err(fs.stat(obj))?;
        let mut buf = vec![0u8; attr.size as usize];
        let n = map_fs_err(fs.read(obj, 0, buf.len(), &mut buf))?;
        use std::io::Write;
        std::io::stdout().write_all(&buf[..n])?;
    }

    if let Some(path) = matches.get_one::<String>("stat") {
        let obj = map_fs_err(fs.resolve_path(path, true))?;
        let attr = map_fs_err(fs.stat(obj))?;
        println!("{:#?}", attr);
        println!("mtime: {:?}", lffs::desc::utc_time(attr.mtime));
    }

    if matches.get_flag("check") {
        let problems = fs.check_consistency();
        if problems.is_empty() {
            println!("volume is consistent");
        } else {
            for p in &problems {
                println!("problem: {}", p);
            }
            map_fs_err(fs.unmount())?;
            return Err(anyhow!("{} consistency problems", problems.len()));
        }
    }

    map_fs_err(fs.unmount())?;
    Ok(())
}
