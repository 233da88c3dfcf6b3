//! # Quire CLI
//!
//! Walkthroughs of collaborative editing against an in-memory hub.
//! Every participant gets its own simulated network link to the hub, so a
//! scenario can take one writer offline while the others keep typing.
//!
//! ```text
//! alice ──link──┐
//!               ├── hub ── registry ── snapshots
//! bob ────link──┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::*;
use quire_doc::{BlockId, BlockKind, MarkType, Operation, RenderedDocument};
use quire_sync::{
    memory_network, Client, ClientDocument, Hub, Identity, MemoryConnector, MemoryStore,
    Selection, SessionState, StaticIdentity, SyncConfig,
};
use tracing_subscriber::EnvFilter;

const DOCUMENT: &str = "meeting-notes";
const WAIT: Duration = Duration::from_secs(5);

// ─── CLI ───────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "quire")]
#[command(about = "Collaborative rich-text editing walkthroughs (Quire)")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Print the final document as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Two writers share a document through the hub
    Demo,
    /// Concurrent typing and formatting on the same words
    Conflict,
    /// One writer goes offline, keeps editing, and reconciles on reconnect
    Offline,
    /// Cursors and presence relayed between writers
    Presence,
}

// ─── Writer: one simulated participant ─────────────────────────────────────

struct Writer {
    name: String,
    link: MemoryConnector,
    doc: ClientDocument,
}

impl Writer {
    async fn join(hub: &Arc<Hub<MemoryStore>>, name: &str) -> Result<Self, String> {
        let (link, listener) = memory_network();
        hub.spawn_listener(listener);
        let client = Client::new(
            link.clone(),
            StaticIdentity(Identity::new(name)),
            Arc::new(MemoryStore::new()),
            config(),
        );
        let doc = client
            .open_document(DOCUMENT)
            .await
            .map_err(|e| e.to_string())?;
        if !doc.session().wait_for(SessionState::Live, WAIT).await {
            return Err(format!("{name} never went live"));
        }
        Ok(Self {
            name: name.to_string(),
            link,
            doc,
        })
    }

    fn edit(&self, op: Operation) -> Result<BlockId, String> {
        self.doc.edit(op).map(|u| u.id).map_err(|e| e.to_string())
    }

    fn add_block(&self, after: Option<BlockId>, kind: BlockKind) -> Result<BlockId, String> {
        self.edit(Operation::InsertBlock { after, kind })
    }

    fn type_text(&self, block: &BlockId, offset: usize, text: &str) -> Result<(), String> {
        self.edit(Operation::InsertText {
            block: block.clone(),
            offset,
            text: text.to_string(),
        })
        .map(|_| ())
    }

    fn render(&self) -> RenderedDocument {
        self.doc.document().render()
    }

    async fn go_offline(&self) {
        self.link.set_online(false);
        while self.doc.state() == SessionState::Live {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn go_online(&self) {
        self.link.set_online(true);
        self.doc.session().wait_for(SessionState::Live, WAIT).await;
    }
}

fn config() -> SyncConfig {
    SyncConfig::builder()
        .heartbeat_interval(200)
        .reconnect(50, 400)
        .build()
}

/// Wait until every writer has its edits confirmed and all renders agree.
async fn settle(writers: &[&Writer]) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let confirmed = writers.iter().all(|w| w.doc.pending_count() == 0);
        if confirmed && convergence_check(writers) {
            return true;
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ─── Pretty printing ──────────────────────────────────────────────────────

fn header(text: &str) {
    let bar = "═".repeat(60);
    println!("\n{}", bar.bright_cyan());
    println!("  {}", text.bold().bright_white());
    println!("{}", bar.bright_cyan());
}

fn section(text: &str) {
    println!("\n{} {}", "▸".bright_yellow(), text.bold());
}

fn step(text: &str) {
    println!("  {} {}", "•".bright_green(), text);
}

fn sync_arrow(from: &str, to: &str) {
    println!(
        "  {} {} {} {}",
        from.bright_magenta(),
        "──sync──▶".bright_cyan(),
        to.bright_magenta(),
        "✓".bright_green()
    );
}

fn styled_run(text: &str, marks: &[MarkType]) -> String {
    let mut out = text.normal();
    for mark in marks {
        out = match mark {
            MarkType::Bold => out.bold(),
            MarkType::Italic => out.italic(),
            MarkType::Underline | MarkType::Link { .. } => out.underline(),
            MarkType::Strikethrough => out.strikethrough(),
            MarkType::Code => out.bright_black(),
            MarkType::Highlight { .. } => out.on_yellow(),
        };
    }
    out.to_string()
}

/// `#RRGGBB` to a terminal colour, white if it does not parse.
fn cursor_color(hex: &str) -> Color {
    let channel = |range: std::ops::Range<usize>| {
        hex.trim_start_matches('#')
            .get(range)
            .and_then(|c| u8::from_str_radix(c, 16).ok())
    };
    match (channel(0..2), channel(2..4), channel(4..6)) {
        (Some(r), Some(g), Some(b)) => Color::TrueColor { r, g, b },
        _ => Color::White,
    }
}

fn block_prefix(kind: &BlockKind) -> String {
    match kind {
        BlockKind::Paragraph => String::new(),
        BlockKind::Heading { level } => format!("{} ", "#".repeat(*level as usize)),
        BlockKind::BulletItem => "• ".to_string(),
        BlockKind::NumberedItem => "1. ".to_string(),
        BlockKind::Todo { checked } => if *checked { "[x] " } else { "[ ] " }.to_string(),
        BlockKind::Quote => "│ ".to_string(),
        BlockKind::CodeBlock => "  ".to_string(),
    }
}

fn show_writer(writer: &Writer) {
    let border = "─".repeat(44);
    println!("  ┌{}┐", border);
    println!(
        "  │ {:^42} │",
        format!("Writer: {} ({})", writer.name, writer.doc.state())
            .bright_yellow()
            .to_string()
    );
    println!("  ├{}┤", border);

    let rendered = writer.render();
    if rendered.blocks.is_empty() {
        println!("  │ {:^42} │", "(empty document)".dimmed().to_string());
    }
    for block in &rendered.blocks {
        let body: String = block
            .runs
            .iter()
            .map(|run| styled_run(&run.text, &run.marks))
            .collect();
        println!("  │ {}{}", block_prefix(&block.kind).bright_blue(), body);
    }
    let pending = writer.doc.pending_count();
    if pending > 0 {
        println!(
            "  │ {}",
            format!("{pending} update(s) awaiting the hub").dimmed()
        );
    }
    println!("  └{}┘", border);
}

fn convergence_check(writers: &[&Writer]) -> bool {
    match writers.split_first() {
        Some((first, rest)) => {
            let base = first.render();
            rest.iter().all(|w| w.render() == base)
        }
        None => true,
    }
}

fn convergence_result(converged: bool) {
    if converged {
        println!(
            "\n  {} {}",
            "✓".bright_green().bold(),
            "ALL WRITERS CONVERGED: documents are identical!"
                .bright_green()
                .bold()
        );
    } else {
        println!(
            "\n  {} {}",
            "✗".bright_red().bold(),
            "DIVERGENCE DETECTED: documents differ!".bright_red().bold()
        );
    }
}

fn hub_text(hub: &Hub<MemoryStore>) -> String {
    hub.registry()
        .get(DOCUMENT)
        .map(|d| d.plain_text())
        .unwrap_or_default()
}

// ─── Demo ──────────────────────────────────────────────────────────────────

async fn run_demo() -> Result<RenderedDocument, String> {
    header("DEMO: Two Writers, One Document");

    let hub = Hub::new("hub", Arc::new(MemoryStore::new()), config());

    section("Phase 1: Alice and Bob join the hub");
    let alice = Writer::join(&hub, "Alice").await?;
    step("alice: connected, session live");
    let bob = Writer::join(&hub, "Bob").await?;
    step("bob:   connected, session live");

    section("Phase 2: Alice drafts, Bob adds an agenda");
    let title = alice.add_block(None, BlockKind::Heading { level: 1 })?;
    alice.type_text(&title, 0, "Weekly sync")?;
    step("alice: heading \"Weekly sync\"");
    sync_arrow("alice", "bob");

    settle(&[&alice, &bob]).await;
    let item = bob.add_block(Some(title.clone()), BlockKind::BulletItem)?;
    bob.type_text(&item, 0, "Release checklist")?;
    step("bob:   bullet \"Release checklist\"");
    sync_arrow("bob", "alice");

    section("Phase 3: Both views after sync");
    let ok = settle(&[&alice, &bob]).await;
    show_writer(&alice);
    show_writer(&bob);
    convergence_result(ok);

    section("Hub copy");
    step(&format!("hub holds {:?}", hub_text(&hub)));

    let merged = alice.render();
    alice.doc.close().await;
    bob.doc.close().await;
    hub.shutdown();
    Ok(merged)
}

// ─── Conflict ──────────────────────────────────────────────────────────────

async fn run_conflict() -> Result<RenderedDocument, String> {
    header("CONFLICT: Same Spot, Same Moment");

    let hub = Hub::new("hub", Arc::new(MemoryStore::new()), config());
    let alice = Writer::join(&hub, "Alice").await?;
    let bob = Writer::join(&hub, "Bob").await?;
    let carol = Writer::join(&hub, "Carol").await?;
    let everyone = [&alice, &bob, &carol];

    section("Phase 1: Shared baseline");
    let block = alice.add_block(None, BlockKind::Paragraph)?;
    alice.type_text(&block, 0, "ship it")?;
    settle(&everyone).await;
    step("baseline: \"ship it\" on all three");

    section("Phase 2: Everyone edits before hearing from the others");
    for writer in &everyone {
        writer.go_offline().await;
    }
    alice.type_text(&block, 0, "Please ")?;
    step("alice: prepends \"Please \"");
    bob.type_text(&block, 7, " today")?;
    step("bob:   appends \" today\"");
    carol.edit(Operation::Format {
        block: block.clone(),
        offset: 0,
        len: 4,
        mark: MarkType::Bold,
        enabled: true,
    })?;
    step("carol: bolds \"ship\"");
    alice.edit(Operation::DeleteText {
        block: block.clone(),
        offset: 11,
        len: 3,
    })?;
    step("alice: deletes \" it\"");

    section("Pre-sync (diverged)");
    for writer in &everyone {
        show_writer(writer);
    }

    section("Phase 3: Reconnect in reverse order");
    for writer in everyone.iter().rev() {
        writer.go_online().await;
        sync_arrow(&writer.name, "hub");
    }

    let ok = settle(&everyone).await;
    section("Merged");
    show_writer(&alice);
    convergence_result(ok);
    step("inserts keep their anchors, the delete only removes what alice saw");
    step("bold covers the characters carol selected, wherever they moved");

    let merged = alice.render();
    for writer in &everyone {
        writer.doc.close().await;
    }
    hub.shutdown();
    Ok(merged)
}

// ─── Offline ───────────────────────────────────────────────────────────────

async fn run_offline() -> Result<RenderedDocument, String> {
    header("OFFLINE: Edit on a Plane, Reconcile on Landing");

    let hub = Hub::new("hub", Arc::new(MemoryStore::new()), config());
    let alice = Writer::join(&hub, "Alice").await?;
    let bob = Writer::join(&hub, "Bob").await?;

    section("Phase 1: Shared outline");
    let todo = alice.add_block(None, BlockKind::Todo { checked: false })?;
    alice.type_text(&todo, 0, "Book venue")?;
    settle(&[&alice, &bob]).await;
    show_writer(&bob);

    section("Phase 2: Alice loses connectivity");
    println!(
        "  {}   {}",
        "╔══════════════════╗".bright_blue(),
        "╔══════════════════╗".bright_red()
    );
    println!(
        "  {}   {}",
        "║  alice (offline) ║".bright_blue(),
        "║  bob + hub       ║".bright_red()
    );
    println!(
        "  {}   {}",
        "╚══════════════════╝".bright_blue(),
        "╚══════════════════╝".bright_red()
    );
    alice.go_offline().await;

    alice.edit(Operation::SetBlockKind {
        block: todo.clone(),
        kind: BlockKind::Todo { checked: true },
    })?;
    let note = alice.add_block(Some(todo.clone()), BlockKind::Paragraph)?;
    alice.type_text(&note, 0, "Venue confirmed for Friday")?;
    step("alice: ticks the todo and adds a note");

    let item = bob.add_block(Some(todo.clone()), BlockKind::BulletItem)?;
    bob.type_text(&item, 0, "Order catering")?;
    step("bob:   adds \"Order catering\"");

    step(&format!(
        "alice has {} update(s) buffered",
        alice.doc.pending_count()
    ));
    show_writer(&alice);
    show_writer(&bob);

    section("Phase 3: Alice reconnects and flushes");
    alice.go_online().await;
    sync_arrow("alice", "hub");
    let ok = settle(&[&alice, &bob]).await;
    show_writer(&alice);
    show_writer(&bob);
    convergence_result(ok);

    let merged = alice.render();
    alice.doc.close().await;
    bob.doc.close().await;
    hub.shutdown();
    Ok(merged)
}

// ─── Presence ──────────────────────────────────────────────────────────────

async fn run_presence() -> Result<RenderedDocument, String> {
    header("PRESENCE: Who Is Here and Where");

    let hub = Hub::new("hub", Arc::new(MemoryStore::new()), config());
    let alice = Writer::join(&hub, "Alice").await?;
    let bob = Writer::join(&hub, "Bob").await?;

    let block = alice.add_block(None, BlockKind::Paragraph)?;
    alice.type_text(&block, 0, "Roadmap for Q3")?;
    settle(&[&alice, &bob]).await;

    section("Phase 1: Alice selects a word");
    alice
        .doc
        .document()
        .awareness()
        .set_selection(Some(Selection {
            block: block.clone(),
            anchor: 8,
            head: 14,
        }));
    step("alice: selects \"for Q3\"");
    tokio::time::sleep(Duration::from_millis(200)).await;

    section("Phase 2: What Bob sees");
    for entry in bob.doc.document().awareness().get_states() {
        let cursor = match &entry.state.selection {
            Some(sel) if sel.is_caret() => format!("caret at {}", sel.head),
            Some(sel) => format!("selection {}..{}", sel.anchor, sel.head),
            None => "no cursor".to_string(),
        };
        step(&format!(
            "{} {} ({:?}, {})",
            "●".color(cursor_color(&entry.state.color)),
            entry.state.display_name.bold(),
            entry.state.status,
            cursor
        ));
    }

    section("Phase 3: Alice leaves");
    let alice_id = alice.doc.identity().client_id.clone();
    alice.doc.close().await;
    let deadline = tokio::time::Instant::now() + WAIT;
    while bob.doc.document().awareness().get(&alice_id).is_some()
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let gone = bob.doc.document().awareness().get(&alice_id).is_none();
    if gone {
        step("bob no longer sees alice's cursor ✓");
    } else {
        step("alice is still listed ✗");
    }

    let merged = bob.render();
    bob.doc.close().await;
    hub.shutdown();
    Ok(merged)
}

// ─── Entry point ───────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Demo => run_demo().await,
        Commands::Conflict => run_conflict().await,
        Commands::Offline => run_offline().await,
        Commands::Presence => run_presence().await,
    };
    match result {
        Ok(rendered) if cli.json => match serde_json::to_string_pretty(&rendered) {
            Ok(json) => println!("{json}"),
            Err(err) => eprintln!("  {} {}", "✗".bright_red().bold(), err),
        },
        Ok(_) => {}
        Err(err) => {
            eprintln!("  {} {}", "✗".bright_red().bold(), err);
            std::process::exit(1);
        }
    }
}
