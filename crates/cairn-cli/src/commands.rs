use std::net::SocketAddr;

use anyhow::Context;
use cairn_crypto::TransformChain;
use cairn_net::{Node, NodeConfig};
use cairn_protocol::IoFlags;
use cairn_types::ObjectId;
use colored::Colorize;
use serde_json::json;

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let format = cli.format;
    match &cli.command {
        Command::Serve(args) => cmd_serve(&cli, args),
        Command::Put(args) => cmd_put(&cli, args, format),
        Command::Get(args) => cmd_get(&cli, args, format),
        Command::Lookup(args) => cmd_lookup(&cli, args, format),
        Command::List(args) => cmd_list(&cli, args, format),
        Command::Id(args) => cmd_id(args, format),
    }
}

/// Configuration file (or defaults) with command-line overrides applied.
fn node_config(cli: &Cli) -> anyhow::Result<NodeConfig> {
    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => NodeConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(root) = &cli.root {
        config.root = Some(root.clone());
    }
    config.peers.extend(cli.peers.iter().copied());
    Ok(config)
}

/// Storage-less node on an ephemeral port, used by one-shot client commands.
fn client_config(cli: &Cli) -> anyhow::Result<NodeConfig> {
    let mut config = node_config(cli)?;
    config.listen_addr = SocketAddr::from(([127, 0, 0, 1], 0));
    config.node_id = None;
    config.root = None;
    config.peers.clear();
    Ok(config)
}

fn connect(cli: &Cli, peer: SocketAddr) -> anyhow::Result<(Node, ObjectId)> {
    let node = Node::start(client_config(cli)?).context("starting client node")?;
    let id = node.add_peer(peer).with_context(|| format!("connecting to {peer}"))?;
    Ok((node, id))
}

fn cmd_serve(cli: &Cli, args: &ServeArgs) -> anyhow::Result<()> {
    let config = node_config(cli)?;
    let node = Node::start(config).context("starting node")?;
    if args.join {
        node.join().context("joining peers")?;
    }
    println!(
        "{} Cairn node {} listening on {}",
        "✓".green().bold(),
        node.id().short_hex().cyan(),
        node.addr().to_string().bold()
    );
    match &node.context().config().root {
        Some(root) => println!("  Storage: {}", root.display()),
        None => println!("  Storage: {}", "none (client only)".dimmed()),
    }
    for (id, addr) in node.peers() {
        println!("  Peer: {} {}", id.short_hex().cyan(), addr);
    }

    tokio::runtime::Runtime::new()?.block_on(tokio::signal::ctrl_c())?;
    tracing::info!("interrupt received, shutting down");
    drop(node);
    Ok(())
}

fn cmd_put(cli: &Cli, args: &PutArgs, format: OutputFormat) -> anyhow::Result<()> {
    let (node, _) = connect(cli, args.peer)?;
    let mut flags = IoFlags::UPDATE;
    if args.append {
        flags.insert(IoFlags::APPEND);
    }
    let ids = node
        .write_file(args.name.as_bytes(), &args.file, args.offset, args.size, flags)
        .with_context(|| format!("uploading {}", args.file.display()))?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&ids)?),
        OutputFormat::Text => {
            println!("{} Stored {}", "✓".green().bold(), args.name.yellow());
            println!("  Name:    {}", ids.name.to_hex().cyan());
            println!("  Content: {}", ids.content.to_hex().cyan());
        }
    }
    Ok(())
}

fn cmd_get(cli: &Cli, args: &GetArgs, format: OutputFormat) -> anyhow::Result<()> {
    let (node, _) = connect(cli, args.peer)?;
    let written = node
        .read_file(args.name.as_bytes(), &args.dest, args.offset, args.size)
        .with_context(|| format!("downloading {}", args.name))?;
    match format {
        OutputFormat::Json => println!(
            "{}",
            json!({ "name": args.name, "dest": args.dest, "bytes": written })
        ),
        OutputFormat::Text => println!(
            "{} Fetched {} ({} bytes) into {}",
            "✓".green().bold(),
            args.name.yellow(),
            written,
            args.dest.display()
        ),
    }
    Ok(())
}

fn cmd_lookup(cli: &Cli, args: &LookupArgs, format: OutputFormat) -> anyhow::Result<()> {
    let target = ObjectId::from_hex(&args.id).context("parsing identifier")?;
    let (node, _) = connect(cli, args.peer)?;
    let (owner, addr) = node.lookup(&target)?;
    match format {
        OutputFormat::Json => println!(
            "{}",
            json!({ "id": target.to_hex(), "owner": owner.to_hex(), "addr": addr })
        ),
        OutputFormat::Text => println!("{} -> {} at {}", target.short_hex().yellow(), owner.to_hex().cyan(), addr),
    }
    Ok(())
}

fn cmd_list(cli: &Cli, args: &ListArgs, format: OutputFormat) -> anyhow::Result<()> {
    let (node, peer) = connect(cli, args.peer)?;
    let ids = node.list(&peer)?;
    match format {
        OutputFormat::Json => {
            let hex: Vec<String> = ids.iter().map(ObjectId::to_hex).collect();
            println!("{}", json!({ "node": peer.to_hex(), "objects": hex }));
        }
        OutputFormat::Text => {
            println!("Node {}: {} objects", peer.short_hex().cyan(), ids.len().to_string().bold());
            for id in &ids {
                println!("  {}", id.to_hex());
            }
        }
    }
    Ok(())
}

/// Every identifier the chain yields for `text`, in chain order.
fn chain_ids(chain: &TransformChain, text: &[u8]) -> anyhow::Result<Vec<(String, ObjectId)>> {
    let names = chain.names();
    let mut ids = Vec::with_capacity(names.len());
    let mut start = 0;
    while start < names.len() {
        let computed = chain.compute(text, start)?;
        ids.push((names[computed.next - 1].clone(), computed.id));
        start = computed.next;
    }
    Ok(ids)
}

fn cmd_id(args: &IdArgs, format: OutputFormat) -> anyhow::Result<()> {
    let ids = chain_ids(&TransformChain::default(), args.text.as_bytes())?;
    match format {
        OutputFormat::Json => {
            let entries: Vec<_> = ids
                .iter()
                .map(|(name, id)| json!({ "transform": name, "id": id.to_hex() }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        OutputFormat::Text => {
            for (name, id) in &ids {
                println!("{:>10}  {}", name.bold(), id.to_hex());
            }
        }
    }
    Ok(())
}
