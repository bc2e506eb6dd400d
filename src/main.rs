use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, Subcommand};
use comfy_table::{Attribute, Cell, Color, Table};
use inquire::{Select, Text};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use invoice_docgen::config::{
    AppSettings, Engine, get_config_path, load_sender_config, load_settings, save_settings,
};
use invoice_docgen::desktop::DesktopHost;
use invoice_docgen::document::format_currency;
use invoice_docgen::model::{InvoiceRecord, InvoiceStatus};
use invoice_docgen::pipeline::{DocumentGenerator, converter_for};
use invoice_docgen::resources::StandardLoader;
use invoice_docgen::store::{InvoiceStore, TomlStore};
use invoice_docgen::{ClientEnvironment, DeliveryMethod, Notification, Notifier};

// ==========================================
// Constants
// ==========================================
const DEFAULT_DATA_ROOT: &str = "~/Documents/Business";
const PAID_GREEN: Color = Color::Rgb { r: 4, g: 120, b: 87 };
const UNPAID_RED: Color = Color::Rgb { r: 185, g: 28, b: 28 };

// ==========================================
// Structs & Enums
// ==========================================

#[derive(Parser)]
#[command(name = "invoice-docgen", about = "Render invoices to PDF and deliver them")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the PDF for an invoice
    Generate {
        /// Invoice id (choose interactively when omitted)
        id: Option<String>,
        /// User agent of the requesting client
        #[arg(long)]
        user_agent: Option<String>,
        /// Platform string of the requesting client
        #[arg(long)]
        platform: Option<String>,
        /// Maximum touch points reported by the client
        #[arg(long, default_value_t = 0)]
        touch_points: u32,
        /// Don't open the result with the system viewer
        #[arg(long)]
        no_open: bool,
    },
    /// List stored invoices
    List,
    /// Show or change the status of an invoice
    Status {
        id: String,
        /// draft, sent, paid or void (prompted when omitted)
        status: Option<InvoiceStatus>,
    },
    /// Store an invoice from a JSON file
    Import { file: String },
    /// Configure data directory and engine
    Config,
}

/// Prints pipeline notifications to the terminal.
struct CliNotifier;

impl Notifier for CliNotifier {
    fn notify(&self, notification: &Notification) {
        match notification {
            Notification::Success {
                method: DeliveryMethod::Download,
                message,
                ..
            } => println!("✅ {}", message),
            Notification::Success { message, .. } => println!("📱 {}", message),
            Notification::Failure { message, .. } => eprintln!("❌ {}", message),
        }
    }
}

// ==========================================
// Main Function
// ==========================================

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };
    if let Commands::Config = command {
        setup_config_wizard()?;
        return Ok(());
    }

    // 1. Initialize configuration
    let settings = match load_settings(&get_config_path())? {
        Some(settings) => settings,
        None => setup_config_wizard()?,
    };
    let root = settings.root();
    fs::create_dir_all(&root).with_context(|| format!("failed to create data directory {:?}", root))?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(command, &root, &settings))
}

async fn run(command: Commands, root: &Path, settings: &AppSettings) -> Result<()> {
    let store = Arc::new(TomlStore::under_root(root));
    match command {
        Commands::Generate {
            id,
            user_agent,
            platform,
            touch_points,
            no_open,
        } => {
            let desktop = ClientEnvironment::desktop();
            let env = ClientEnvironment::new(
                user_agent.unwrap_or(desktop.user_agent),
                platform.unwrap_or(desktop.platform),
                touch_points,
            );
            generate(store, root, settings, id, &env, !no_open).await
        }
        Commands::List => list_invoices(store.as_ref()).await,
        Commands::Status { id, status } => change_status(store.as_ref(), &id, status).await,
        Commands::Import { file } => import_invoice(store.as_ref(), Path::new(&file)).await,
        Commands::Config => setup_config_wizard().map(drop),
    }
}

// ==========================================
// 1. PDF Generation
// ==========================================

async fn generate(
    store: Arc<TomlStore>,
    root: &Path,
    settings: &AppSettings,
    id: Option<String>,
    env: &ClientEnvironment,
    open_files: bool,
) -> Result<()> {
    let id = match id {
        Some(id) => id,
        None => match select_invoice(store.as_ref()).await? {
            Some(id) => id,
            None => {
                println!("Cancelled");
                return Ok(());
            }
        },
    };
    let invoice = store.fetch_invoice(&id).await?;
    let sender = load_sender_config(root)?;

    let generator = DocumentGenerator::new(
        store,
        converter_for(settings.pipeline.engine)?,
        Arc::new(StandardLoader::new(root)),
        Arc::new(DesktopHost::under_root(root, open_files)?),
        settings.pipeline.clone(),
        sender,
    )
    .with_notifier(Arc::new(CliNotifier));

    println!("🔨 Generating invoice {}...", invoice.invoice_number);
    if let Err(e) = generator.generate_document(invoice, env).await {
        // The notifier has already reported it.
        log::debug!("generation failed: {:?}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn select_invoice(store: &dyn InvoiceStore) -> Result<Option<String>> {
    let invoices = store.list_invoices().await?;
    if invoices.is_empty() {
        bail!("no invoices stored yet, add one with `invoice-docgen import FILE`");
    }
    let options: Vec<String> = invoices.iter().map(invoice_label).collect();
    match Select::new("Select Invoice to generate:", options)
        .with_page_size(10)
        .raw_prompt()
    {
        Ok(choice) => Ok(Some(invoices[choice.index].id.clone())),
        Err(_) => Ok(None),
    }
}

fn invoice_label(invoice: &InvoiceRecord) -> String {
    format!(
        "{} | {} | {} | {}",
        invoice.invoice_number,
        invoice.client.name.as_deref().unwrap_or("(no client)"),
        format_currency(invoice.total()),
        invoice.status
    )
}

// ==========================================
// 2. List Logic
// ==========================================

async fn list_invoices(store: &dyn InvoiceStore) -> Result<()> {
    let invoices = store.list_invoices().await?;
    if invoices.is_empty() {
        println!("(None found)");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec![
        Cell::new("Invoice"),
        Cell::new("Client"),
        Cell::new("Issued"),
        Cell::new("Total"),
        Cell::new("Status"),
        Cell::new("PDF"),
    ]);

    let mut outstanding = 0.0;
    for invoice in &invoices {
        let status_cell = match invoice.status {
            InvoiceStatus::Paid => Cell::new(invoice.status).fg(PAID_GREEN),
            InvoiceStatus::Sent => Cell::new(invoice.status).fg(UNPAID_RED),
            _ => Cell::new(invoice.status),
        };
        if invoice.status == InvoiceStatus::Sent {
            outstanding += invoice.total();
        }
        table.add_row(vec![
            Cell::new(&invoice.invoice_number),
            Cell::new(invoice.client.name.as_deref().unwrap_or("-")),
            Cell::new(invoice.issue_date.format("%Y-%m-%d")),
            Cell::new(format_currency(invoice.total())),
            status_cell,
            Cell::new(if invoice.pdf_generated { "✔" } else { "" }),
        ]);
    }
    table.add_row(vec![
        Cell::new("Outstanding").add_attribute(Attribute::Bold),
        Cell::new(""),
        Cell::new(""),
        Cell::new(format_currency(outstanding)).add_attribute(Attribute::Bold),
        Cell::new(""),
        Cell::new(""),
    ]);

    println!("\n--- Invoices ---");
    println!("{table}");
    Ok(())
}

// ==========================================
// 3. Status & Import
// ==========================================

async fn change_status(store: &dyn InvoiceStore, id: &str, status: Option<InvoiceStatus>) -> Result<()> {
    let invoice = store.fetch_invoice(id).await?;
    let status = match status {
        Some(status) => status,
        None => {
            let options = vec![
                InvoiceStatus::Draft,
                InvoiceStatus::Sent,
                InvoiceStatus::Paid,
                InvoiceStatus::Void,
            ];
            let prompt = format!("Status for {} (currently {}):", invoice.invoice_number, invoice.status);
            match Select::new(&prompt, options).prompt() {
                Ok(status) => status,
                Err(_) => {
                    println!("Cancelled");
                    return Ok(());
                }
            }
        }
    };
    store.update_invoice_status(id, status).await?;
    println!("✅ {} marked as {}", invoice.invoice_number, status);
    Ok(())
}

async fn import_invoice(store: &TomlStore, file: &Path) -> Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {:?}", file))?;
    let record: InvoiceRecord =
        serde_json::from_str(&content).with_context(|| format!("{:?} is not a valid invoice", file))?;
    store.save_invoice(&record).await?;
    println!("✅ Imported {} ({})", record.invoice_number, record.id);
    Ok(())
}

// ==========================================
// 4. Config
// ==========================================

fn setup_config_wizard() -> Result<AppSettings> {
    println!("\n⚙️  --- Configuration Setup ---");
    let path = get_config_path();
    let current = load_settings(&path).ok().flatten();
    let default_root = current
        .as_ref()
        .map(|s| s.data_root.clone())
        .unwrap_or_else(|| DEFAULT_DATA_ROOT.to_string());

    let data_root = Text::new("Root data directory:")
        .with_default(&default_root)
        .prompt()?;
    let engine = match Select::new("PDF engine:", vec!["builtin", "typst"]).prompt()? {
        "typst" => Engine::Typst,
        _ => Engine::Builtin,
    };

    let mut settings = AppSettings::new(data_root);
    if let Some(current) = current {
        settings.pipeline = current.pipeline;
    }
    settings.pipeline.engine = engine;
    save_settings(&path, &settings)?;
    println!("✅ Settings saved to {:?}", path);
    Ok(settings)
}
