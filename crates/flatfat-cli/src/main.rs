#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use flatfat::{ByteDevice, FatVolume, FileByteDevice, VolumeConfig};
use serde::Serialize;
use std::env;
use std::path::Path;

#[derive(Debug, Serialize)]
struct InspectOutput {
    block_size: u32,
    table_size: u32,
    disk_capacity: u64,
    image_len: u64,
    data_offset: u64,
    free_blocks: usize,
    entries: usize,
    root_block: u32,
    root_size: u32,
}

#[derive(Debug, Serialize)]
struct ListEntry {
    name: String,
    size: u32,
    first_block: u32,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "format" => {
            let Some(path) = args.next() else {
                bail!("format requires an image path");
            };
            let rest: Vec<String> = args.collect();
            let defaults = VolumeConfig::default();
            let config = VolumeConfig::new(
                flag_value(&rest, "--capacity")?.unwrap_or(defaults.disk_capacity),
                flag_value(&rest, "--block-size")?.unwrap_or(defaults.block_size),
            );
            format_cmd(Path::new(&path), &config)
        }
        "inspect" => {
            let Some(path) = args.next() else {
                bail!("inspect requires an image path");
            };
            let rest: Vec<String> = args.collect();
            let json = rest.iter().any(|arg| arg == "--json");
            let block_size = flag_value(&rest, "--block-size")?;
            inspect(Path::new(&path), block_size, json)
        }
        "ls" => {
            let Some(path) = args.next() else {
                bail!("ls requires an image path");
            };
            let rest: Vec<String> = args.collect();
            let json = rest.iter().any(|arg| arg == "--json");
            let block_size = flag_value(&rest, "--block-size")?;
            ls(Path::new(&path), block_size, json)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("flatfat-cli\n");
    println!("USAGE:");
    println!("  flatfat-cli format <image-path> [--capacity BYTES] [--block-size BYTES]");
    println!("  flatfat-cli inspect <image-path> [--block-size BYTES] [--json]");
    println!("  flatfat-cli ls <image-path> [--block-size BYTES] [--json]");
}

/// Parse the value following `flag`, if the flag is present.
fn flag_value<T>(args: &[String], flag: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let Some(pos) = args.iter().position(|arg| arg == flag) else {
        return Ok(None);
    };
    let Some(raw) = args.get(pos + 1) else {
        bail!("{flag} requires a value");
    };
    raw.parse::<T>()
        .map(Some)
        .with_context(|| format!("invalid value for {flag}: {raw}"))
}

fn format_cmd(path: &Path, config: &VolumeConfig) -> Result<()> {
    let layout = config.layout().context("invalid volume geometry")?;
    let dev = FileByteDevice::create(path, layout.image_len())
        .with_context(|| format!("failed to create image {}", path.display()))?;
    let vol = FatVolume::format(dev, config)
        .with_context(|| format!("failed to format {}", path.display()))?;
    vol.sync().context("failed to sync image")?;

    println!(
        "formatted {}: {} blocks of {} bytes ({} bytes on disk)",
        path.display(),
        layout.table_size(),
        layout.block_size(),
        layout.image_len()
    );
    Ok(())
}

fn mount_image(path: &Path, block_size: Option<u32>) -> Result<FatVolume<FileByteDevice>> {
    let dev = FileByteDevice::open(path)
        .with_context(|| format!("failed to open image {}", path.display()))?;
    let block_size = block_size.unwrap_or(VolumeConfig::default().block_size);
    let len = dev.len_bytes();
    let config = VolumeConfig::for_image_len(len, block_size)
        .with_context(|| format!("cannot derive geometry of {}", path.display()))?;
    FatVolume::mount(dev, &config).with_context(|| format!("failed to mount {}", path.display()))
}

fn inspect(path: &Path, block_size: Option<u32>, json: bool) -> Result<()> {
    let vol = mount_image(path, block_size)?;
    let layout = *vol.layout();
    let entries = vol.list().context("failed to read root directory")?;
    let output = InspectOutput {
        block_size: layout.block_size().get(),
        table_size: layout.table_size(),
        disk_capacity: u64::from(layout.table_size()) * u64::from(layout.block_size().get()),
        image_len: layout.image_len(),
        data_offset: layout.data_offset(),
        free_blocks: vol.free_blocks(),
        entries: entries.len(),
        root_block: vol.root().first_block.0,
        root_size: vol.root().size,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("flatfat volume");
        println!("block_size: {}", output.block_size);
        println!("table_size: {}", output.table_size);
        println!("disk_capacity: {}", output.disk_capacity);
        println!("image_len: {}", output.image_len);
        println!("data_offset: {}", output.data_offset);
        println!("free_blocks: {}", output.free_blocks);
        println!("entries: {}", output.entries);
        println!("root: block {} size {}", output.root_block, output.root_size);
    }
    Ok(())
}

fn ls(path: &Path, block_size: Option<u32>, json: bool) -> Result<()> {
    let vol = mount_image(path, block_size)?;
    let entries: Vec<ListEntry> = vol
        .list()
        .context("failed to read root directory")?
        .into_iter()
        .map(|entry| ListEntry {
            name: entry.name.to_string(),
            size: entry.size,
            first_block: entry.first_block.0,
        })
        .collect();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&entries).context("serialize output")?
        );
        return Ok(());
    }
    for entry in &entries {
        println!("{:<8} {:>10} {:>8}", entry.name, entry.size, entry.first_block);
    }
    Ok(())
}
