//! ldrkit - Patch, edit and repack Balong-family boot loaders
//!
//! This tool applies signature patches to loader images, converts the
//! embedded partition table to and from an editable text form, and unpacks
//! and repacks USB loader containers.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use ldrkit_core::container::{self, block_file_name, HEADER_FILE, HEADER_SIZE, MANIFEST_FILE};
use ldrkit_core::ptable::{self, TABLE_SIZE};
use ldrkit_core::signature::BadBlockOutcome;
use ldrkit_core::{
    ContainerHeader, ErrorKind, Manifest, PartitionTable, PatchTable, Scanner, ScannerConfig,
    Warning,
};
use std::ffi::OsString;
use std::fs;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Patch, edit and repack Balong-family boot loaders
#[derive(Parser, Debug)]
#[command(name = "ldrkit")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply revision and bad-block patches to a loader image
    Patch(PatchArgs),

    /// Convert standalone partition table files
    #[command(subcommand)]
    Ptable(PtableCommand),

    /// Work with the partition table embedded in a loader image
    #[command(subcommand)]
    Loader(LoaderCommand),

    /// Split a USB loader container into its blocks
    Unpack(UnpackArgs),

    /// Rebuild a USB loader container from an unpack directory
    Pack(PackArgs),
}

#[derive(Args, Debug)]
struct PatchArgs {
    /// Loader image to patch
    loader: PathBuf,

    /// Write the patched image here; without it only a check is performed
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Also apply the patch that disables the bad-block check
    #[arg(short = 'b', long)]
    bad_block: bool,

    /// Patch table (TOML) with the revision signatures and payloads
    #[arg(short, long, env = "LDRKIT_PATCH_TABLE")]
    table: PathBuf,

    /// Only consider word-aligned matches past the reset vectors
    #[arg(long)]
    arm_aligned: bool,
}

#[derive(Subcommand, Debug)]
enum PtableCommand {
    /// Convert a binary table to text
    Dump {
        /// Binary partition table
        input: PathBuf,
        /// Output file (default: stdout)
        output: Option<PathBuf>,
    },
    /// Convert a text table to binary
    Build {
        /// Text partition table
        input: PathBuf,
        /// Output file (default: stdout)
        output: Option<PathBuf>,
    },
    /// Print the partition map of a binary table
    Show {
        /// Binary partition table
        input: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum LoaderCommand {
    /// Print the partition map embedded in a loader
    Show {
        /// Loader image
        loader: PathBuf,
    },
    /// Save the embedded partition table to a file
    Extract {
        /// Loader image
        loader: PathBuf,
        /// Output file
        #[arg(short, long, default_value = "ptable.bin")]
        output: PathBuf,
    },
    /// Replace the embedded partition table, in place
    Replace {
        /// Loader image
        loader: PathBuf,
        /// Binary partition table to inject
        table: PathBuf,
    },
}

#[derive(Args, Debug)]
struct UnpackArgs {
    /// USB loader file
    input: PathBuf,

    /// Output directory (default: <input>.unpacked)
    #[arg(short = 'd', long)]
    dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct PackArgs {
    /// Directory produced by `unpack`
    dir: PathBuf,

    /// Output file
    #[arg(short, long)]
    output: PathBuf,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Printing only fails if stdout/stderr are gone
            let _ = e.print();
            return ExitCode::from(usage_exit_code(&e));
        }
    };

    // Initialize tracing
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

/// Help and version requests succeed; every other usage error is 1
fn usage_exit_code(err: &clap::Error) -> u8 {
    match err.kind() {
        clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
        _ => 1,
    }
}

/// Distinct exit status per error kind
fn exit_code(err: &anyhow::Error) -> u8 {
    let kind = err.chain().find_map(|cause| {
        if let Some(e) = cause.downcast_ref::<ldrkit_core::Error>() {
            Some(e.kind())
        } else if cause.downcast_ref::<io::Error>().is_some() {
            Some(ErrorKind::Io)
        } else {
            None
        }
    });

    match kind {
        None => 1,
        Some(ErrorKind::NotFound) => 2,
        Some(ErrorKind::FormatInvalid) => 3,
        Some(ErrorKind::BoundsViolation) => 4,
        Some(ErrorKind::Io) => 5,
    }
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::Patch(args) => cmd_patch(args),
        Command::Ptable(PtableCommand::Dump { input, output }) => {
            cmd_ptable_dump(input, output.as_deref())
        }
        Command::Ptable(PtableCommand::Build { input, output }) => {
            cmd_ptable_build(input, output.as_deref())
        }
        Command::Ptable(PtableCommand::Show { input }) => cmd_ptable_show(input),
        Command::Loader(LoaderCommand::Show { loader }) => cmd_loader_show(loader),
        Command::Loader(LoaderCommand::Extract { loader, output }) => {
            cmd_loader_extract(loader, output)
        }
        Command::Loader(LoaderCommand::Replace { loader, table }) => {
            cmd_loader_replace(loader, table)
        }
        Command::Unpack(args) => cmd_unpack(args),
        Command::Pack(args) => cmd_pack(args),
    }
}

fn read_file(path: &Path) -> ldrkit_core::Result<Vec<u8>> {
    debug!("Reading {}", path.display());
    fs::read(path).map_err(|e| ldrkit_core::Error::file_read(path, e))
}

fn write_file(path: &Path, data: &[u8]) -> ldrkit_core::Result<()> {
    debug!("Writing {} bytes to {}", data.len(), path.display());
    fs::write(path, data).map_err(|e| ldrkit_core::Error::file_write(path, e))
}

fn write_stdout(data: &[u8]) -> Result<()> {
    let mut stdout = io::stdout().lock();
    stdout.write_all(data).context("Failed to write to stdout")?;
    stdout.flush().context("Failed to write to stdout")
}

/// Short content digest (first 8 hex chars of blake3) for reports
fn short_digest(data: &[u8]) -> String {
    blake3::hash(data).to_hex()[..8].to_string()
}

fn cmd_patch(args: &PatchArgs) -> Result<()> {
    let table = PatchTable::from_path(&args.table)
        .with_context(|| format!("Failed to load patch table: {}", args.table.display()))?;
    info!(
        "Patch table {} ({} revisions)",
        table.version,
        table.revisions.len()
    );

    let mut image = read_file(&args.loader)?;
    let config = if args.arm_aligned {
        ScannerConfig::arm_aligned()
    } else {
        ScannerConfig::new()
    };

    let report = table
        .apply(&Scanner::with_config(config), &mut image, args.bad_block)
        .with_context(|| format!("Failed to patch {}", args.loader.display()))?;

    match &report.revision {
        Some(p) => println!(
            "* {} signature found at offset {:08x}, patched at {:08x}",
            p.name, p.site.match_offset, p.site.location
        ),
        None => println!("! No revision signature found"),
    }
    match &report.bad_block {
        BadBlockOutcome::NotRequested => {}
        BadBlockOutcome::NotConfigured => println!("! Patch table has no bad-block patch"),
        BadBlockOutcome::NotFound => println!("! Bad-block signature not found"),
        BadBlockOutcome::Applied(p) => println!(
            "* {} signature found at offset {:08x}, patched at {:08x}",
            p.name, p.site.match_offset, p.site.location
        ),
    }

    if !report.modified() {
        return Err(ldrkit_core::Error::signature_not_found("any listed revision"))
            .with_context(|| format!("Nothing to patch in {}", args.loader.display()));
    }

    if let Some(output) = &args.output {
        write_file(output, &image)?;
        println!(
            "Wrote {} ({} bytes, blake3 {})",
            output.display(),
            image.len(),
            short_digest(&image)
        );
    }
    Ok(())
}

fn read_table_file(path: &Path) -> Result<PartitionTable> {
    let data = read_file(path)?;
    let table = ptable::decode_binary(&data)
        .with_context(|| format!("Unable to read partition table from {}", path.display()))?;
    Ok(table)
}

fn cmd_ptable_dump(input: &Path, output: Option<&Path>) -> Result<()> {
    let table = read_table_file(input)?;
    if !table.has_valid_head() {
        warn!("{}", Warning::HeadMagicMismatch);
    }

    let text = ptable::encode_text(&table);
    match output {
        Some(path) => write_file(path, text.as_bytes())?,
        None => write_stdout(text.as_bytes())?,
    }
    Ok(())
}

fn cmd_ptable_build(input: &Path, output: Option<&Path>) -> Result<()> {
    let file = fs::File::open(input).map_err(|e| ldrkit_core::Error::file_read(input, e))?;
    let table = ptable::decode_text(BufReader::new(file))
        .with_context(|| format!("Failed to parse {}", input.display()))?;
    info!("Parsed {} partition(s)", table.entries().len());

    let data = ptable::encode_binary(&table);
    match output {
        Some(path) => write_file(path, &data)?,
        None => write_stdout(&data)?,
    }
    Ok(())
}

fn cmd_ptable_show(input: &Path) -> Result<()> {
    let table = read_table_file(input)?;
    table
        .validate_head()
        .with_context(|| format!("{} is not a partition table", input.display()))?;
    print!("{}", table.map());
    Ok(())
}

/// Finds and decodes the table embedded in a loader image
fn find_embedded_table(loader: &Path, image: &[u8]) -> Result<(usize, PartitionTable)> {
    let offset = ptable::locate(image)
        .ok_or(ldrkit_core::Error::TableNotFound)
        .with_context(|| format!("No partition table in {}", loader.display()))?;
    let table = ptable::decode_binary(&image[offset..])
        .with_context(|| format!("Partition table at {:#x} is cut short", offset))?;
    info!("Partition table found at offset {:#x}", offset);
    Ok((offset, table))
}

fn cmd_loader_show(loader: &Path) -> Result<()> {
    let image = read_file(loader)?;
    let (offset, table) = find_embedded_table(loader, &image)?;
    println!("Partition table at offset {:#010x}\n", offset);
    print!("{}", table.map());
    Ok(())
}

fn cmd_loader_extract(loader: &Path, output: &Path) -> Result<()> {
    let image = read_file(loader)?;
    let (offset, _) = find_embedded_table(loader, &image)?;
    write_file(output, &image[offset..offset + TABLE_SIZE])?;
    println!("Extracted partition table to {}", output.display());
    Ok(())
}

fn cmd_loader_replace(loader: &Path, table_path: &Path) -> Result<()> {
    let replacement = read_table_file(table_path)?;
    replacement
        .validate_head()
        .with_context(|| format!("{} is not a partition table", table_path.display()))?;

    let mut image = read_file(loader)?;
    let (offset, current) = find_embedded_table(loader, &image)?;
    debug!(
        "Replacing {} partition(s) with {}",
        current.logical_entries().len(),
        replacement.logical_entries().len()
    );

    image[offset..offset + TABLE_SIZE].copy_from_slice(&ptable::encode_binary(&replacement));
    write_file(loader, &image)?;
    println!(
        "Replaced partition table at offset {:#x} in {}",
        offset,
        loader.display()
    );
    Ok(())
}

/// `<input>.unpacked`
fn default_unpack_dir(input: &Path) -> PathBuf {
    let mut name = OsString::from(input.as_os_str());
    name.push(".unpacked");
    PathBuf::from(name)
}

fn cmd_unpack(args: &UnpackArgs) -> Result<()> {
    let data = read_file(&args.input)?;
    let decoded = container::decode(&data)
        .with_context(|| format!("{} is not a USB loader", args.input.display()))?;

    if decoded.blocks.is_empty() {
        warn!("{}", no_blocks_hint(&decoded.header));
    }

    let dir = args
        .dir
        .clone()
        .unwrap_or_else(|| default_unpack_dir(&args.input));
    fs::create_dir_all(&dir).map_err(|e| ldrkit_core::Error::directory_create(&dir, e))?;

    println!("USB Loader: {}", args.input.display());
    println!("Output directory: {}\n", dir.display());

    let header_path = dir.join(HEADER_FILE);
    write_file(&header_path, &data[..HEADER_SIZE])?;
    println!(
        "[*] Saved header: {} ({} bytes)",
        header_path.display(),
        HEADER_SIZE
    );

    for block in &decoded.blocks {
        let path = dir.join(block_file_name(block.slot));
        write_file(&path, block.payload)?;

        let d = &block.descriptor;
        println!("[{}] Block: {}", block.slot, block.name());
        println!("    - Mode: {}, Address: {:#010x}", d.mode, d.address);
        println!("    - Size: {:#010x} ({} bytes)", d.size, d.size);
        println!("    - Offset: {:#010x}", d.offset);
        println!("    - blake3: {}", short_digest(block.payload));
        println!("    - Saved to: {}", path.display());
    }

    let source = args
        .input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| args.input.display().to_string());
    let manifest = Manifest::from_container(&source, data.len() as u64, &decoded);
    let manifest_path = dir.join(MANIFEST_FILE);
    write_file(&manifest_path, manifest.render().as_bytes())?;

    println!("\nTotal blocks extracted: {}", decoded.blocks.len());
    println!("Metadata saved to: {}", manifest_path.display());
    Ok(())
}

fn no_blocks_hint(header: &ContainerHeader) -> String {
    let first = &header.slots[0];
    format!(
        "No blocks found: slot 0 has size {:#x} at offset {:#x} (blocks must start at or after {:#x})",
        first.size, first.offset, HEADER_SIZE
    )
}

/// Reads `header.bin` if present; its reserved bytes are carried over
fn load_header_template(dir: &Path) -> Result<ContainerHeader> {
    let path = dir.join(HEADER_FILE);
    if !path.exists() {
        return Ok(ContainerHeader::default());
    }

    let data = read_file(&path)?;
    match ContainerHeader::decode(&data) {
        Ok(header) => Ok(header),
        Err(e) => {
            warn!("Ignoring {}: {}", path.display(), e);
            Ok(ContainerHeader::default())
        }
    }
}

fn cmd_pack(args: &PackArgs) -> Result<()> {
    let manifest_path = args.dir.join(MANIFEST_FILE);
    let file = fs::File::open(&manifest_path)
        .map_err(|e| ldrkit_core::Error::file_read(&manifest_path, e))?;
    let manifest = Manifest::parse(BufReader::new(file))
        .with_context(|| format!("Failed to parse {}", manifest_path.display()))?;

    if manifest.blocks.iter().all(|b| b.size == 0) {
        bail!("No blocks found in {}", manifest_path.display());
    }

    let template = load_header_template(&args.dir)?;
    let specs = manifest.to_block_specs(|block| {
        let path = Manifest::block_path(&args.dir, block)?;
        read_file(&path)
    })?;

    let encoded = container::encode(&template, &specs)
        .with_context(|| format!("Failed to pack {}", args.dir.display()))?;

    for (slot, d) in encoded.descriptors.iter().enumerate() {
        println!("[{}] Packed block: {}", slot, container::block_name(slot));
        println!("    - Mode: {}, Address: {:#010x}", d.mode, d.address);
        println!("    - Size: {:#010x} ({} bytes)", d.size, d.size);
        println!("    - Offset: {:#010x}", d.offset);
    }

    write_file(&args.output, &encoded.data)?;
    println!(
        "\nPacked {} block(s) to {} ({} bytes, blake3 {})",
        encoded.descriptors.len(),
        args.output.display(),
        encoded.data.len(),
        short_digest(&encoded.data)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldrkit_core::{BlockSpec, BootMode, PartitionEntry};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn run_args(args: &[&str]) -> Result<()> {
        let cli = Cli::try_parse_from(std::iter::once("ldrkit").chain(args.iter().copied()))?;
        run(&cli)
    }

    fn path_str(path: &Path) -> &str {
        path.to_str().unwrap()
    }

    fn sample_container() -> Vec<u8> {
        let blocks = vec![
            BlockSpec::new(BootMode::Direct, 0x1000, vec![0x5a; 64]).unwrap(),
            BlockSpec::new(BootMode::CompanionRestart, 0x3000_0000, (0..=255).collect()).unwrap(),
        ];
        container::encode(&ContainerHeader::default(), &blocks)
            .unwrap()
            .data
    }

    fn sample_table(names: &[&str]) -> PartitionTable {
        let mut table = PartitionTable::new();
        table.set_version("V7R2");
        for (i, name) in names.iter().enumerate() {
            let mut e = PartitionEntry::named(name).unwrap();
            e.start = 0x40000 * i as u32;
            e.length = 0x40000;
            table.push_entry(e).unwrap();
        }
        table
    }

    fn loader_with_table(table: &PartitionTable, at: usize) -> Vec<u8> {
        let mut image = vec![0xeeu8; at + TABLE_SIZE + 0x100];
        image[at..at + TABLE_SIZE].copy_from_slice(&ptable::encode_binary(table));
        image
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_usage_errors_exit_with_one() {
        let err = Cli::try_parse_from(["ldrkit", "unpack"]).unwrap_err();
        assert_eq!(usage_exit_code(&err), 1);

        let err = Cli::try_parse_from(["ldrkit", "frobnicate"]).unwrap_err();
        assert_eq!(usage_exit_code(&err), 1);

        let err = Cli::try_parse_from(["ldrkit", "--help"]).unwrap_err();
        assert_eq!(usage_exit_code(&err), 0);

        let err = Cli::try_parse_from(["ldrkit", "--version"]).unwrap_err();
        assert_eq!(usage_exit_code(&err), 0);
    }

    #[test]
    fn test_unpack_without_blocks() {
        let temp = TempDir::new().unwrap();
        let mut header = ContainerHeader::default();
        header.slots[0] = ldrkit_core::BlockDescriptor {
            mode: BootMode::Direct,
            size: 0x20,
            address: 0x1000,
            offset: 0x54,
        };
        let mut data = header.encode();
        data.extend_from_slice(&[0u8; 0x20]);
        let input = temp.path().join("old.bin");
        fs::write(&input, &data).unwrap();

        let hint = no_blocks_hint(&header);
        assert!(hint.contains("offset 0x54"));
        assert!(hint.contains("0xc4"));

        let dir = temp.path().join("out");
        run_args(&["unpack", path_str(&input), "-d", path_str(&dir)]).unwrap();
        assert!(dir.join(MANIFEST_FILE).is_file());
        assert!(!dir.join(block_file_name(0)).exists());
    }

    #[test]
    fn test_default_unpack_dir() {
        assert_eq!(
            default_unpack_dir(Path::new("fw/usbloader.bin")),
            PathBuf::from("fw/usbloader.bin.unpacked")
        );
    }

    #[test]
    fn test_short_digest() {
        assert_eq!(short_digest(b"hello"), short_digest(b"hello"));
        assert_ne!(short_digest(b"hello"), short_digest(b"world"));
        assert_eq!(short_digest(b"").len(), 8);
    }

    #[test]
    fn test_unpack_then_pack_is_identical() {
        let temp = TempDir::new().unwrap();
        let input = temp.path().join("usbloader.bin");
        let original = sample_container();
        fs::write(&input, &original).unwrap();

        run_args(&["unpack", path_str(&input)]).unwrap();
        let dir = temp.path().join("usbloader.bin.unpacked");
        assert!(dir.join(MANIFEST_FILE).is_file());
        assert_eq!(fs::read(dir.join(HEADER_FILE)).unwrap().len(), HEADER_SIZE);
        assert_eq!(fs::read(dir.join("block0_raminit.bin")).unwrap(), vec![0x5a; 64]);

        let output = temp.path().join("rebuilt.bin");
        run_args(&["pack", path_str(&dir), "-o", path_str(&output)]).unwrap();
        assert_eq!(fs::read(&output).unwrap(), original);
    }

    #[test]
    fn test_pack_after_editing_a_block() {
        let temp = TempDir::new().unwrap();
        let input = temp.path().join("usbloader.bin");
        fs::write(&input, sample_container()).unwrap();

        let dir = temp.path().join("parts");
        run_args(&["unpack", path_str(&input), "-d", path_str(&dir)]).unwrap();
        fs::write(dir.join("block0_raminit.bin"), [0x77u8; 10]).unwrap();

        let output = temp.path().join("edited.bin");
        run_args(&["pack", path_str(&dir), "-o", path_str(&output)]).unwrap();

        let rebuilt = fs::read(&output).unwrap();
        let decoded = container::decode(&rebuilt).unwrap();
        assert_eq!(decoded.blocks.len(), 2);
        assert_eq!(decoded.blocks[0].payload, &[0x77u8; 10]);
        assert_eq!(decoded.blocks[1].descriptor.offset, HEADER_SIZE as u32 + 10);
        assert_eq!(decoded.blocks[1].descriptor.address, 0x3000_0000);
    }

    #[test]
    fn test_pack_rejects_escaping_paths() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join(MANIFEST_FILE),
            "[Block0]\nlmode=1\nsize=4\nfile=../outside.bin\n",
        )
        .unwrap();

        let output = temp.path().join("out.bin");
        let err = run_args(&["pack", path_str(temp.path()), "-o", path_str(&output)]).unwrap_err();
        assert_eq!(exit_code(&err), 3);
        assert!(!output.exists());
    }

    #[test]
    fn test_unpack_rejects_non_container() {
        let temp = TempDir::new().unwrap();
        let input = temp.path().join("junk.bin");
        fs::write(&input, vec![0xffu8; 512]).unwrap();

        let err = run_args(&["unpack", path_str(&input)]).unwrap_err();
        assert_eq!(exit_code(&err), 3);
    }

    #[test]
    fn test_ptable_build_then_dump() {
        let temp = TempDir::new().unwrap();
        let text_in = temp.path().join("ptable.txt");
        let bin = temp.path().join("ptable.bin");
        let text_out = temp.path().join("ptable-dump.txt");

        let text = ptable::encode_text(&sample_table(&["m3boot", "fastboot", "T"]));
        fs::write(&text_in, &text).unwrap();

        run_args(&["ptable", "build", path_str(&text_in), path_str(&bin)]).unwrap();
        assert_eq!(fs::read(&bin).unwrap().len(), TABLE_SIZE);

        run_args(&["ptable", "dump", path_str(&bin), path_str(&text_out)]).unwrap();
        assert_eq!(fs::read_to_string(&text_out).unwrap(), text);
    }

    #[test]
    fn test_loader_extract_and_replace() {
        let temp = TempDir::new().unwrap();
        let loader = temp.path().join("usbloader.bin");
        let original = sample_table(&["m3boot", "fastboot", "T"]);
        fs::write(&loader, loader_with_table(&original, 0x1234)).unwrap();

        let extracted = temp.path().join("ptable.bin");
        run_args(&["loader", "extract", path_str(&loader), "-o", path_str(&extracted)]).unwrap();
        let table = ptable::decode_binary(&fs::read(&extracted).unwrap()).unwrap();
        assert_eq!(table, original);

        let replacement = sample_table(&["m3boot", "fastboot", "kernel", "T"]);
        let replacement_path = temp.path().join("new.bin");
        fs::write(&replacement_path, ptable::encode_binary(&replacement)).unwrap();

        run_args(&["loader", "replace", path_str(&loader), path_str(&replacement_path)]).unwrap();
        let image = fs::read(&loader).unwrap();
        assert_eq!(image.len(), 0x1234 + TABLE_SIZE + 0x100);
        assert_eq!(ptable::locate(&image), Some(0x1234));
        assert_eq!(ptable::decode_binary(&image[0x1234..]).unwrap(), replacement);
        assert!(image[..0x1234].iter().all(|&b| b == 0xee));
    }

    #[test]
    fn test_loader_replace_rejects_non_table() {
        let temp = TempDir::new().unwrap();
        let loader = temp.path().join("usbloader.bin");
        let image = loader_with_table(&sample_table(&["a"]), 0x40);
        fs::write(&loader, &image).unwrap();

        let bogus = temp.path().join("bogus.bin");
        fs::write(&bogus, vec![0u8; TABLE_SIZE]).unwrap();

        let err = run_args(&["loader", "replace", path_str(&loader), path_str(&bogus)]).unwrap_err();
        assert_eq!(exit_code(&err), 3);
        assert_eq!(fs::read(&loader).unwrap(), image);
    }

    #[test]
    fn test_loader_without_table() {
        let temp = TempDir::new().unwrap();
        let loader = temp.path().join("usbloader.bin");
        fs::write(&loader, vec![0u8; 4096]).unwrap();

        let err = run_args(&["loader", "show", path_str(&loader)]).unwrap_err();
        assert_eq!(exit_code(&err), 2);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("missing.bin");
        let err = run_args(&["ptable", "show", path_str(&missing)]).unwrap_err();
        assert_eq!(exit_code(&err), 5);
        assert!(format!("{:#}", err).contains("missing.bin"));
    }

    const PATCH_TABLE: &str = r#"
        version = "test"

        [[revision]]
        name = "V7R2"
        signature = "de ad be ef 01 02 03 04"
        offset = 0
        payload = "00 00 a0 e3"

        [bad_block]
        name = "isbad"
        signature = "ca fe ba be 05 06 07 08"
        offset = -8
        payload = "00 00 a0 e3"
    "#;

    #[test]
    fn test_patch_writes_output() {
        let temp = TempDir::new().unwrap();
        let table = temp.path().join("patches.toml");
        fs::write(&table, PATCH_TABLE).unwrap();

        let mut image = vec![0u8; 0x200];
        image[0x100..0x108].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef, 1, 2, 3, 4]);
        image[0x180..0x188].copy_from_slice(&[0xca, 0xfe, 0xba, 0xbe, 5, 6, 7, 8]);
        let loader = temp.path().join("usbloader.bin");
        fs::write(&loader, &image).unwrap();

        let output = temp.path().join("patched.bin");
        run_args(&[
            "patch",
            path_str(&loader),
            "-b",
            "-t",
            path_str(&table),
            "-o",
            path_str(&output),
        ])
        .unwrap();

        let patched = fs::read(&output).unwrap();
        assert_eq!(&patched[0x108..0x10c], &[0x00, 0x00, 0xa0, 0xe3]);
        assert_eq!(&patched[0x180..0x184], &[0x00, 0x00, 0xa0, 0xe3]);
        assert_eq!(fs::read(&loader).unwrap(), image);
    }

    #[test]
    fn test_patch_nothing_found() {
        let temp = TempDir::new().unwrap();
        let table = temp.path().join("patches.toml");
        fs::write(&table, PATCH_TABLE).unwrap();
        let loader = temp.path().join("usbloader.bin");
        fs::write(&loader, vec![0u8; 0x100]).unwrap();

        let output = temp.path().join("patched.bin");
        let err = run_args(&[
            "patch",
            path_str(&loader),
            "-t",
            path_str(&table),
            "-o",
            path_str(&output),
        ])
        .unwrap_err();
        assert_eq!(exit_code(&err), 2);
        assert!(!output.exists());
    }

    #[test]
    fn test_exit_code_for_plain_errors() {
        assert_eq!(exit_code(&anyhow::anyhow!("something else")), 1);
        let wrapped = anyhow::Error::new(ldrkit_core::Error::TableNotFound).context("outer");
        assert_eq!(exit_code(&wrapped), 2);
    }
}
