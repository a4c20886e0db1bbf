//! Weft CLI - static linking of flat WebAssembly modules
//!
//! Commands:
//!   weft link --config <json> -o <artifact>  - Compose modules per a config
//!   weft inspect <artifact>                  - Display an artifact manifest

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use weft::adapter::CanonicalOptions;
use weft::emit::decode;
use weft::resolve::{ExternDecl, ImportDecl};
use weft::types::{Field, TypeDef, TypeId};
use weft::{DedupPolicy, ExportRef, Linker};

#[derive(Parser)]
#[command(name = "weft")]
#[command(about = "Static linker for flat WebAssembly modules", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compose modules into a single artifact
    Link {
        /// Path to the link configuration (JSON)
        #[arg(long)]
        config: PathBuf,

        /// Where to write the composed artifact
        #[arg(long, short = 'o')]
        output: PathBuf,
    },
    /// Inspect a composed artifact and display its manifest
    Inspect {
        /// Path to the artifact
        artifact: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Link { config, output } => link_command(&config, &output),
        Commands::Inspect { artifact, json } => inspect_command(&artifact, json),
    }
}

/// The link configuration. Types reference each other by position in the
/// `types` array; positions are remapped to interned ids at load time.
#[derive(Deserialize)]
struct Config {
    #[serde(default)]
    types: Vec<TypeDef>,
    #[serde(default)]
    imports: Vec<ImportDecl>,
    modules: Vec<ModuleEntry>,
    #[serde(default)]
    bindings: Vec<BindingEntry>,
    #[serde(default)]
    memory: Option<ExportRef>,
    #[serde(default)]
    realloc: Option<ExportRef>,
    #[serde(default)]
    share_across_memories: bool,
    #[serde(default)]
    exports: Vec<ExportEntry>,
}

#[derive(Deserialize)]
struct ModuleEntry {
    name: String,
    path: PathBuf,
}

#[derive(Deserialize)]
struct BindingEntry {
    consumer: String,
    instance: String,
    func: String,
    #[serde(default)]
    options: CanonicalOptions,
}

#[derive(Deserialize)]
struct ExportEntry {
    name: String,
    module: String,
    export: String,
}

fn link_command(config_path: &PathBuf, output: &PathBuf) -> anyhow::Result<()> {
    let config_bytes = std::fs::read(config_path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", config_path.display(), e))?;
    let config: Config = serde_json::from_slice(&config_bytes)
        .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

    let mut linker = Linker::new();

    // Declaration interns structurally, so positions in the config do not
    // map one-to-one onto table ids; remap references as we go.
    let mut ids: Vec<TypeId> = Vec::with_capacity(config.types.len());
    for def in &config.types {
        let id = linker.types_mut().declare(remap_type(def, &ids)?)?;
        ids.push(id);
    }

    for decl in &config.imports {
        let exports = decl
            .exports
            .iter()
            .map(|(name, extern_decl)| {
                Ok((
                    name.clone(),
                    match extern_decl {
                        ExternDecl::Type(pos) => ExternDecl::Type(remap_id(*pos, &ids)?),
                        ExternDecl::Func(pos) => ExternDecl::Func(remap_id(*pos, &ids)?),
                    },
                ))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        linker.import_instance(ImportDecl {
            name: decl.name.clone(),
            exports,
        });
    }

    for entry in &config.modules {
        let bytes = std::fs::read(&entry.path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", entry.path.display(), e))?;
        linker.add_module(&entry.name, bytes)?;
    }

    for binding in &config.bindings {
        linker.bind(
            &binding.consumer,
            &binding.instance,
            &binding.func,
            binding.options.clone(),
        );
    }

    if let Some(memory) = &config.memory {
        linker.designate_memory(&memory.module, &memory.export);
    }
    if let Some(realloc) = &config.realloc {
        linker.designate_realloc(&realloc.module, &realloc.export);
    }
    linker.dedup_policy(DedupPolicy {
        share_across_memories: config.share_across_memories,
    });

    for export in &config.exports {
        linker.export(&export.name, &export.module, &export.export);
    }

    let artifact = linker.link()?;
    std::fs::write(output, &artifact.bytes)
        .map_err(|e| anyhow::anyhow!("Failed to write {}: {}", output.display(), e))?;

    println!(
        "wrote {} ({} modules, {} exports, {} dispatch tables)",
        output.display(),
        artifact.manifest.instances.len(),
        artifact.manifest.exports.len(),
        artifact.manifest.dispatch_tables.len()
    );
    Ok(())
}

/// Remap a config type's positional references to interned ids.
fn remap_type(def: &TypeDef, ids: &[TypeId]) -> anyhow::Result<TypeDef> {
    let remap_fields = |fields: &[Field]| -> anyhow::Result<Vec<Field>> {
        fields
            .iter()
            .map(|f| {
                Ok(Field {
                    name: f.name.clone(),
                    ty: remap_id(f.ty, ids)?,
                })
            })
            .collect()
    };
    Ok(match def {
        TypeDef::Primitive(p) => TypeDef::Primitive(*p),
        TypeDef::String => TypeDef::String,
        TypeDef::Record(fields) => TypeDef::Record(remap_fields(fields)?),
        TypeDef::List(element) => TypeDef::List(remap_id(*element, ids)?),
        TypeDef::Func(func) => TypeDef::Func(weft::types::FuncType {
            params: remap_fields(&func.params)?,
            result: func.result.map(|r| remap_id(r, ids)).transpose()?,
        }),
    })
}

fn remap_id(position: TypeId, ids: &[TypeId]) -> anyhow::Result<TypeId> {
    ids.get(position.0 as usize)
        .copied()
        .ok_or_else(|| anyhow::anyhow!("type reference {} is out of range", position.0))
}

fn inspect_command(artifact_path: &PathBuf, json: bool) -> anyhow::Result<()> {
    let bytes = std::fs::read(artifact_path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", artifact_path.display(), e))?;
    let artifact = decode(&bytes)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&artifact.manifest)?);
        return Ok(());
    }

    let manifest = &artifact.manifest;
    if !manifest.hosts.is_empty() {
        println!("hosts:");
        for (index, host) in manifest.hosts.iter().enumerate() {
            println!("  [{index}] {host}");
        }
    }

    println!("instances:");
    for (position, instance) in manifest.instances.iter().enumerate() {
        let index = manifest.hosts.len() + position;
        let size = artifact.modules[position].1.len();
        println!("  [{index}] {} ({size} bytes)", instance.module);
        for arg in &instance.args {
            println!(
                "      {}::{} <- [{}].{}",
                arg.namespace, arg.field, arg.target.instance, arg.target.export
            );
        }
    }

    if !manifest.dispatch_tables.is_empty() {
        println!("dispatch-tables:");
        for table in &manifest.dispatch_tables {
            println!(
                "  {}: {} entries, {}",
                table.export, table.size, table.signature
            );
        }
    }

    if !manifest.exports.is_empty() {
        println!("exports:");
        for export in &manifest.exports {
            println!(
                "  {} ({}) <- [{}].{}",
                export.name, export.kind, export.instance, export.export
            );
        }
    }

    Ok(())
}
