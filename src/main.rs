//! Blockvault - an encrypted single-file virtual file system.
//!
//! Stores files and folders as compressed, encrypted blocks inside one
//! archive file, with the directory tree sealed under a password.

use anyhow::{bail, Context, Result};
use blockvault::crypto::KdfDescriptor;
use blockvault::vfs::{PasswordSource, VfsPath, WriteOptions};
use blockvault::{Archive, ArchiveConfig, CipherKind, Error};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "blockvault")]
#[command(author, version, about, long_about = None)]
#[command(
    about = "Encrypted single-file virtual file system",
    long_about = "Keeps files, folders and tags in one archive file: content is compressed and encrypted into fixed-size blocks, and the directory tree is sealed under a password."
)]
struct Cli {
    /// Password for non-interactive use
    #[arg(long, env = "BLOCKVAULT_PASSWORD", hide = true, hide_env_values = true, global = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new archive
    Init {
        /// Archive file to create
        archive: PathBuf,

        /// Key derivation function
        #[arg(long, value_enum, default_value_t = KdfChoice::Argon2)]
        kdf: KdfChoice,

        /// Block size in bytes (power of two)
        #[arg(long, default_value_t = blockvault::config::DEFAULT_BLOCK_SIZE)]
        block_size: u32,

        /// Store content without zlib compression
        #[arg(long)]
        no_compression: bool,

        /// zlib level (0-9)
        #[arg(long, default_value_t = blockvault::config::DEFAULT_COMPRESSION_LEVEL)]
        compression_level: u32,

        /// Default cipher for file content (aes-256-ctr, chacha20, none)
        #[arg(long, default_value = "aes-256-ctr")]
        cipher: CipherKind,

        /// Bytes reserved for the metadata tree
        #[arg(long, default_value_t = blockvault::config::DEFAULT_METADATA_CAPACITY)]
        metadata_capacity: u64,
    },

    /// List directory contents
    Ls {
        /// Archive file
        archive: PathBuf,

        /// Path to list (default: /)
        #[arg(default_value = "/")]
        vfs_path: String,
    },

    /// Store a file, string, stdin, or a whole directory tree
    Put {
        /// Archive file
        archive: PathBuf,

        /// Destination path in the archive
        vfs_path: String,

        /// Input file or directory
        #[arg(long, conflicts_with = "data")]
        input: Option<PathBuf>,

        /// String data to write
        #[arg(long, conflicts_with = "input")]
        data: Option<String>,

        /// Cipher for this content (default: the archive's)
        #[arg(long)]
        cipher: Option<CipherKind>,

        /// Media type (default: guessed from the name)
        #[arg(long)]
        media_type: Option<String>,
    },

    /// Extract a file
    Get {
        /// Archive file
        archive: PathBuf,

        /// Path to read
        vfs_path: String,

        /// Output file (default: stdout)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Export even if the integrity check fails
        #[arg(long)]
        force: bool,
    },

    /// Delete a file or directory and wipe its blocks
    Rm {
        /// Archive file
        archive: PathBuf,

        /// Path to delete
        vfs_path: String,
    },

    /// Create a directory
    Mkdir {
        /// Archive file
        archive: PathBuf,

        /// Path of the new directory
        vfs_path: String,
    },

    /// Manage file tags
    Tag {
        #[command(subcommand)]
        action: TagAction,
    },

    /// Show archive status
    Info {
        /// Archive file
        archive: PathBuf,
    },

    /// Read back every file and check its digest
    Verify {
        /// Archive file
        archive: PathBuf,
    },

    /// Change the archive password
    Passwd {
        /// Archive file
        archive: PathBuf,

        /// Switch to another key derivation function
        #[arg(long, value_enum)]
        kdf: Option<KdfChoice>,
    },
}

#[derive(Subcommand)]
enum TagAction {
    /// Add a tag to a file
    Add {
        archive: PathBuf,
        vfs_path: String,
        tag: String,
    },
    /// Remove a tag from a file
    Rm {
        archive: PathBuf,
        vfs_path: String,
        tag: String,
    },
    /// List files carrying a tag
    Find { archive: PathBuf, tag: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum KdfChoice {
    Pbkdf2,
    Scrypt,
    Argon2,
    Plaintext,
}

impl KdfChoice {
    fn descriptor(self) -> KdfDescriptor {
        match self {
            KdfChoice::Pbkdf2 => KdfDescriptor::pbkdf2(),
            KdfChoice::Scrypt => KdfDescriptor::scrypt(),
            KdfChoice::Argon2 => KdfDescriptor::argon2id(),
            KdfChoice::Plaintext => KdfDescriptor::plaintext(),
        }
    }
}

/// Takes the password from the environment, or prompts on the terminal.
struct Prompt<'a> {
    preset: Option<&'a str>,
    prompt: &'static str,
}

impl PasswordSource for Prompt<'_> {
    fn password(&mut self, _descriptor: &KdfDescriptor) -> blockvault::Result<Zeroizing<Vec<u8>>> {
        if let Some(preset) = self.preset {
            return Ok(Zeroizing::new(preset.as_bytes().to_vec()));
        }
        let entered = Zeroizing::new(rpassword::prompt_password(self.prompt).map_err(Error::Io)?);
        Ok(Zeroizing::new(entered.as_bytes().to_vec()))
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let preset = cli.password.as_deref();

    match cli.command {
        Commands::Init {
            archive,
            kdf,
            block_size,
            no_compression,
            compression_level,
            cipher,
            metadata_capacity,
        } => {
            let config = ArchiveConfig {
                block_size,
                compression: !no_compression,
                compression_level,
                metadata_capacity,
                cipher,
            };
            cmd_init(&archive, kdf.descriptor(), config, preset)
        }

        Commands::Ls { archive, vfs_path } => cmd_ls(&open(&archive, preset)?, &vfs_path),

        Commands::Put {
            archive,
            vfs_path,
            input,
            data,
            cipher,
            media_type,
        } => {
            let options = WriteOptions {
                cipher,
                media_type,
                cancel: None,
            };
            cmd_put(&mut open(&archive, preset)?, &vfs_path, input, data, &options)
        }

        Commands::Get {
            archive,
            vfs_path,
            output,
            force,
        } => cmd_get(&open(&archive, preset)?, &vfs_path, output, force),

        Commands::Rm { archive, vfs_path } => {
            let wiped = open(&archive, preset)?
                .delete(&vfs_path)
                .with_context(|| format!("failed to delete {}", vfs_path))?;
            println!("Deleted {} ({} blocks wiped)", vfs_path, wiped);
            Ok(())
        }

        Commands::Mkdir { archive, vfs_path } => {
            open(&archive, preset)?
                .create_dir(&vfs_path)
                .with_context(|| format!("failed to create {}", vfs_path))?;
            println!("Created directory {}", vfs_path);
            Ok(())
        }

        Commands::Tag { action } => cmd_tag(action, preset),

        Commands::Info { archive } => cmd_info(&open(&archive, preset)?),

        Commands::Verify { archive } => cmd_verify(&open(&archive, preset)?),

        Commands::Passwd { archive, kdf } => cmd_passwd(&archive, kdf, preset),
    }
}

fn open(path: &Path, preset: Option<&str>) -> Result<Archive> {
    let mut source = Prompt {
        preset,
        prompt: "Password: ",
    };
    Archive::open_with(path, &mut source).with_context(|| format!("failed to open {}", path.display()))
}

/// Ask for a new password twice, unless one was supplied.
fn new_password(descriptor: &KdfDescriptor, preset: Option<&str>) -> Result<Zeroizing<Vec<u8>>> {
    if descriptor.is_plaintext() {
        return Ok(Zeroizing::new(Vec::new()));
    }
    if let Some(preset) = preset {
        return Ok(Zeroizing::new(preset.as_bytes().to_vec()));
    }

    let password = Zeroizing::new(rpassword::prompt_password("New password: ")?);
    let confirm = Zeroizing::new(rpassword::prompt_password("Confirm password: ")?);
    if *password != *confirm {
        bail!("passwords do not match");
    }
    Ok(Zeroizing::new(password.as_bytes().to_vec()))
}

fn cmd_init(path: &Path, descriptor: KdfDescriptor, config: ArchiveConfig, preset: Option<&str>) -> Result<()> {
    let password = new_password(&descriptor, preset)?;
    let archive = Archive::create(path, config, descriptor, &password)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let info = archive.info()?;

    println!("Archive initialized successfully!");
    println!("  Path:             {}", info.path.display());
    println!("  Block size:       {} bytes", info.block_size);
    match info.compression {
        Some(level) => println!("  Compression:      zlib level {}", level),
        None => println!("  Compression:      off"),
    }
    println!("  Key derivation:   {}", info.kdf);
    println!("  Default cipher:   {}", info.default_cipher);

    Ok(())
}

fn cmd_ls(archive: &Archive, vfs_path: &str) -> Result<()> {
    let entries = archive.list_dir(vfs_path)?;

    if entries.is_empty() {
        println!("(empty)");
    } else {
        for entry in entries {
            let type_char = if entry.is_dir { 'd' } else { '-' };
            let size = if entry.is_dir {
                "-".to_string()
            } else {
                format!("{}", entry.size)
            };
            let media_type = entry.media_type.as_deref().unwrap_or("");
            println!("{} {:>10}  {:<28} {}", type_char, size, media_type, entry.name);
        }
    }

    Ok(())
}

fn cmd_put(
    archive: &mut Archive,
    vfs_path: &str,
    input: Option<PathBuf>,
    data: Option<String>,
    options: &WriteOptions,
) -> Result<()> {
    match (input, data) {
        (Some(path), None) if path.is_dir() => put_tree(archive, vfs_path, &path, options),
        (Some(path), None) => {
            let mut file = File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
            put_stream(archive, vfs_path, &mut file, options)
        }
        (None, Some(s)) => put_stream(archive, vfs_path, &mut s.as_bytes(), options),
        (None, None) => put_stream(archive, vfs_path, &mut io::stdin().lock(), options),
        (Some(_), Some(_)) => bail!("--input and --data are mutually exclusive"),
    }
}

fn put_stream(archive: &mut Archive, vfs_path: &str, src: &mut dyn io::Read, options: &WriteOptions) -> Result<()> {
    let mut written = 0u64;
    archive
        .write_file_with(vfs_path, src, options, &mut |n: u64| written += n)
        .with_context(|| format!("failed to write {}", vfs_path))?;
    println!("Wrote {} bytes to {}", written, vfs_path);
    Ok(())
}

fn put_tree(archive: &mut Archive, vfs_path: &str, root: &Path, options: &WriteOptions) -> Result<()> {
    let base = VfsPath::parse(vfs_path)?;
    ensure_dir(archive, &base)?;

    let mut files = 0usize;
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let relative = entry.path().strip_prefix(root)?;
        let target = relative
            .iter()
            .try_fold(base.clone(), |path, part| path.join(&part.to_string_lossy()))?;

        if entry.file_type().is_dir() {
            ensure_dir(archive, &target)?;
        } else if entry.file_type().is_file() {
            let mut file = File::open(entry.path())
                .with_context(|| format!("failed to open {}", entry.path().display()))?;
            put_stream(archive, &target.to_string(), &mut file, options)?;
            files += 1;
        } else {
            log::warn!("skipping {}: not a regular file", entry.path().display());
        }
    }

    println!("Stored {} files under {}", files, base);
    Ok(())
}

fn ensure_dir(archive: &mut Archive, path: &VfsPath) -> Result<()> {
    if path.is_root() {
        return Ok(());
    }
    match archive.create_dir(&path.to_string()) {
        Ok(_) => Ok(()),
        Err(Error::PathExists(_)) if archive.stat(&path.to_string())?.is_directory() => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to create {}", path)),
    }
}

fn cmd_get(archive: &Archive, vfs_path: &str, output: Option<PathBuf>, force: bool) -> Result<()> {
    let reader = archive.open_reader(vfs_path, !force)?;

    match output {
        Some(path) => {
            let mut file = File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
            let written = match reader.copy_to(&mut file, &mut |_: u64| {}) {
                Ok(n) => n,
                Err(e) => {
                    drop(file);
                    let _ = std::fs::remove_file(&path);
                    if matches!(e, Error::Integrity(_)) {
                        return Err(e).context("integrity check failed; use --force to export anyway");
                    }
                    return Err(e.into());
                }
            };
            println!("Wrote {} bytes to {}", written, path.display());
        }
        None => {
            let stdout = io::stdout();
            let mut lock = stdout.lock();
            reader.copy_to(&mut lock, &mut |_: u64| {})?;
            lock.flush()?;
        }
    }

    Ok(())
}

fn cmd_tag(action: TagAction, preset: Option<&str>) -> Result<()> {
    match action {
        TagAction::Add {
            archive,
            vfs_path,
            tag,
        } => {
            if open(&archive, preset)?.add_tag(&vfs_path, &tag)? {
                println!("Tagged {} with {}", vfs_path, tag);
            } else {
                println!("{} already tagged {}", vfs_path, tag);
            }
        }
        TagAction::Rm {
            archive,
            vfs_path,
            tag,
        } => {
            if open(&archive, preset)?.remove_tag(&vfs_path, &tag)? {
                println!("Removed tag {} from {}", tag, vfs_path);
            } else {
                println!("{} was not tagged {}", vfs_path, tag);
            }
        }
        TagAction::Find { archive, tag } => {
            for path in open(&archive, preset)?.find_by_tag(&tag)? {
                println!("{}", path);
            }
        }
    }
    Ok(())
}

fn cmd_info(archive: &Archive) -> Result<()> {
    let info = archive.info()?;

    println!("Blockvault Archive");
    println!("==================");
    println!("Path:             {}", info.path.display());
    println!("Format version:   {}", info.version);
    println!("Block size:       {} bytes", info.block_size);
    match info.compression {
        Some(level) => println!("Compression:      zlib level {}", level),
        None => println!("Compression:      off"),
    }
    println!("Key derivation:   {}", info.kdf);
    println!("Default cipher:   {}", info.default_cipher);
    println!();
    println!("Blocks:");
    println!("  Frontier:       {}", info.frontier);
    println!("  Live:           {}", info.live_blocks);
    println!("  Dead:           {}", info.dead_blocks);
    println!("  Archive size:   {} bytes", info.archive_len);
    println!();
    println!("Contents:");
    println!("  Directories:    {}", info.dir_count);
    println!("  Files:          {}", info.file_count);
    println!("  Total size:     {} bytes", info.total_file_size);
    println!("  Stored size:    {} bytes", info.total_disk_size);

    Ok(())
}

fn cmd_verify(archive: &Archive) -> Result<()> {
    let report = archive.verify()?;

    println!("Archive Verification");
    println!("====================");
    println!("Files checked:    {}", report.files_checked);
    println!("Bytes verified:   {}", report.bytes_checked);

    if report.is_clean() {
        if report.files_checked > 0 {
            println!();
            println!("✓ All files are intact");
        }
        return Ok(());
    }

    println!();
    println!("Damaged Files:");
    for (path, reason) in &report.damaged {
        println!("  {} ({})", path, reason);
    }
    bail!("{} damaged files", report.damaged.len())
}

fn cmd_passwd(path: &Path, kdf: Option<KdfChoice>, preset: Option<&str>) -> Result<()> {
    let mut archive = Archive::open_with(
        path,
        &mut Prompt {
            preset,
            prompt: "Current password: ",
        },
    )
    .with_context(|| format!("failed to open {}", path.display()))?;

    let descriptor = match kdf {
        Some(choice) => choice.descriptor(),
        None => archive.descriptor().reseeded(),
    };
    let password = new_password(&descriptor, None)?;
    archive
        .change_password(descriptor, &password)
        .context("failed to change password")?;

    println!("Password changed successfully");
    Ok(())
}
