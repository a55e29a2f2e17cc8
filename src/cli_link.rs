use agri_price_engine::catalog_store::{
    EntityKind, NewCanonicalProduct, SourceEntity, SourceKind, SqliteCatalogStore, UnlinkedFilter,
};
use agri_price_engine::cli_style::{self, get_styles, CommandGroup, CommandHelp, TableBuilder};
use agri_price_engine::config::{AppConfig, CliConfig, FileConfig};
use agri_price_engine::PriceEngine;
use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use rustyline::{
    completion::Completer, highlight::Highlighter, history::FileHistory, validate::Validator,
    CompletionType, Config, Editor, Helper,
};

fn parse_path(s: &str) -> Result<PathBuf> {
    let original_path = PathBuf::from(s);
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

fn parse_kind(s: &str) -> Result<EntityKind, String> {
    EntityKind::from_db_str(&s.trim().to_lowercase().replace('-', "_")).ok_or_else(|| {
        format!(
            "unknown kind '{}', expected one of: product, variety, country, market, price_stage",
            s
        )
    })
}

fn parse_source(s: &str) -> Result<SourceKind, String> {
    SourceKind::from_db_str(&s.trim().to_uppercase())
        .ok_or_else(|| format!("unknown source '{}', expected one of: AZ, EU, FAO, FPMA", s))
}

#[derive(Parser, Debug)]
#[command(styles=get_styles())]
struct CliArgs {
    /// Directory holding prices.db.
    #[clap(value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Optional TOML config, same format as the engine's.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,
}

#[derive(Parser)]
#[command(styles=get_styles(), name = "", disable_help_subcommand = true)]
struct InnerCli {
    #[command(subcommand)]
    command: InnerCommand,
}

#[derive(Subcommand)]
enum InnerCommand {
    /// Lists source entities of a kind that still need a canonical link.
    Unlinked {
        #[clap(value_parser = parse_kind)]
        kind: EntityKind,
        #[clap(long, value_parser = parse_source)]
        source: Option<SourceKind>,
        #[clap(long)]
        name: Option<String>,
        /// Also list entities an operator explicitly left unlinked.
        #[clap(long)]
        include_manual: bool,
        #[clap(long, default_value_t = 25)]
        limit: usize,
    },

    /// Shows a source entity and its links.
    Show { source_id: i64 },

    /// Ranks canonical candidates for a source entity.
    Suggest {
        #[clap(value_parser = parse_kind)]
        kind: EntityKind,
        source_id: i64,
        #[clap(long, default_value_t = 5)]
        limit: usize,
    },

    /// Manually links a source entity to a canonical record.
    Link {
        #[clap(value_parser = parse_kind)]
        kind: EntityKind,
        source_id: i64,
        canonical_id: i64,
    },

    /// Manually unlinks a source entity. The matcher won't relink it.
    Unlink {
        #[clap(value_parser = parse_kind)]
        kind: EntityKind,
        source_id: i64,
    },

    /// Runs the matcher over one kind.
    Match {
        #[clap(value_parser = parse_kind)]
        kind: EntityKind,
    },

    /// Shows all canonical products.
    Products,

    /// Creates a canonical country.
    AddCountry { iso_code: String, name: String },

    /// Creates a canonical market in a country.
    AddMarket {
        country_id: i64,
        name: String,
        #[clap(long)]
        market_type: Option<String>,
    },

    /// Creates a canonical product.
    AddProduct {
        name: String,
        #[clap(long)]
        local_name: Option<String>,
        #[clap(long)]
        category: Option<String>,
        #[clap(long)]
        default_unit: Option<String>,
    },

    /// Creates a canonical variety of a product.
    AddVariety { product_id: i64, name: String },

    /// Creates a canonical price stage.
    AddStage { code: String, name: String },

    /// Creates the built-in price stages that are missing.
    SeedStages,

    /// Deletes a canonical record nothing depends on.
    Delete {
        #[clap(value_parser = parse_kind)]
        kind: EntityKind,
        id: i64,
    },

    /// Shows the path of the current price db.
    Where,

    /// Shows this help.
    Help,

    /// Close this program.
    Exit,
}

enum CommandExecutionResult {
    Ok,
    Exit,
    Error(String),
}

fn command_help() -> Vec<CommandHelp> {
    let entry = |group, name, args, description| CommandHelp {
        group,
        name,
        args,
        description,
    };
    vec![
        entry(CommandGroup::Linking, "unlinked", "<kind> [--source S] [--name N]", "List unlinked source entities"),
        entry(CommandGroup::Linking, "show", "<source_id>", "Show a source entity"),
        entry(CommandGroup::Linking, "suggest", "<kind> <source_id>", "Rank canonical candidates"),
        entry(CommandGroup::Linking, "link", "<kind> <source_id> <canonical_id>", "Link manually"),
        entry(CommandGroup::Linking, "unlink", "<kind> <source_id>", "Unlink manually"),
        entry(CommandGroup::Linking, "match", "<kind>", "Run the matcher"),
        entry(CommandGroup::Catalog, "products", "", "List canonical products"),
        entry(CommandGroup::Catalog, "add-country", "<iso> <name>", "Create a country"),
        entry(CommandGroup::Catalog, "add-market", "<country_id> <name>", "Create a market"),
        entry(CommandGroup::Catalog, "add-product", "<name>", "Create a product"),
        entry(CommandGroup::Catalog, "add-variety", "<product_id> <name>", "Create a variety"),
        entry(CommandGroup::Catalog, "add-stage", "<code> <name>", "Create a price stage"),
        entry(CommandGroup::Catalog, "seed-stages", "", "Create the built-in price stages"),
        entry(CommandGroup::Catalog, "delete", "<kind> <id>", "Delete an unused canonical record"),
        entry(CommandGroup::System, "where", "", "Show the database path"),
        entry(CommandGroup::System, "help", "", "Show this help"),
        entry(CommandGroup::System, "exit", "", "Quit"),
    ]
}

fn print_source_entities(entities: &[SourceEntity], kind: EntityKind) {
    if entities.is_empty() {
        cli_style::print_empty_list("nothing to review");
        return;
    }
    let mut table = TableBuilder::new(&["Id", "Source", "Code", "Name", "Local name", "Link"]);
    for entity in entities {
        let (canonical_id, _, is_manual) = entity.link_for(kind);
        let link = match (canonical_id, is_manual) {
            (Some(id), _) => id.to_string(),
            (None, true) => "manual: none".to_string(),
            (None, false) => "-".to_string(),
        };
        table.add_row(vec![
            entity.id.to_string(),
            entity.source.to_string(),
            entity.external_code.clone(),
            entity.name.clone(),
            entity.local_name.clone().unwrap_or_default(),
            link,
        ]);
    }
    table.print();
}

fn print_link(label: &str, link: (Option<i64>, Option<f64>, bool)) {
    let (canonical_id, score, is_manual) = link;
    let value = match canonical_id {
        Some(id) => format!(
            "{} ({}, score {:.2})",
            id,
            if is_manual { "manual" } else { "auto" },
            score.unwrap_or(0.0)
        ),
        None if is_manual => "unlinked by operator".to_string(),
        None => "unlinked".to_string(),
    };
    cli_style::print_key_value_highlight(label, &value);
}

fn execute_command(line: String, engine: &PriceEngine, db_path: &str) -> CommandExecutionResult {
    if line.is_empty() {
        return CommandExecutionResult::Ok;
    }

    let args =
        shlex::split(&line).unwrap_or_else(|| line.split_whitespace().map(String::from).collect());

    let cli = InnerCli::try_parse_from(std::iter::once(" ").chain(args.iter().map(String::as_str)));

    let cli = match cli {
        Ok(cli) => cli,
        Err(e) => {
            if e.print().is_err() {
                println!("{}", e);
            }
            return CommandExecutionResult::Ok;
        }
    };

    cli_style::print_command_echo(&line);
    let outcome = match cli.command {
        InnerCommand::Unlinked {
            kind,
            source,
            name,
            include_manual,
            limit,
        } => {
            let filter = UnlinkedFilter {
                source,
                name_contains: name,
                include_manual,
                limit: Some(limit),
            };
            engine
                .list_unlinked(kind, &filter)
                .map(|entities| print_source_entities(&entities, kind))
        }
        InnerCommand::Show { source_id } => engine.get_source_entity(source_id).map(|entity| {
            cli_style::print_section_header(&format!("{} {}", entity.kind, entity.id));
            cli_style::print_key_value("Source", entity.source.to_db_str());
            cli_style::print_key_value("Code", &entity.external_code);
            cli_style::print_key_value("Name", &entity.name);
            if let Some(local) = &entity.local_name {
                cli_style::print_key_value("Local name", local);
            }
            if let Some(parent) = entity.parent_id {
                cli_style::print_key_value("Parent source entity", &parent.to_string());
            }
            print_link("Canonical", entity.link_for(entity.kind));
            if entity.kind == EntityKind::Product {
                print_link("Variety", entity.link_for(EntityKind::Variety));
            }
            cli_style::print_section_footer();
        }),
        InnerCommand::Suggest {
            kind,
            source_id,
            limit,
        } => engine
            .suggest_links(kind, source_id, limit)
            .map(|candidates| {
                if candidates.is_empty() {
                    cli_style::print_empty_list("no candidate scored above zero");
                }
                for candidate in candidates {
                    cli_style::print_list_item(
                        &format!(
                            "{} {}  score {:.3}",
                            kind, candidate.canonical_candidate_id, candidate.score
                        ),
                        1,
                    );
                }
            }),
        InnerCommand::Link {
            kind,
            source_id,
            canonical_id,
        } => engine
            .link_entity(kind, source_id, Some(canonical_id))
            .map(|_| {
                cli_style::print_success(&format!(
                    "Linked source {} to {} {}",
                    source_id, kind, canonical_id
                ))
            }),
        InnerCommand::Unlink { kind, source_id } => engine
            .unlink_entity(kind, source_id)
            .map(|_| cli_style::print_success(&format!("Unlinked source {}", source_id))),
        InnerCommand::Match { kind } => engine.run_matching(kind).map(|summary| {
            cli_style::print_success(&format!("{} linked", summary.matched));
            if summary.unmatched > 0 {
                cli_style::print_warning(&format!("{} left for review", summary.unmatched));
            }
        }),
        InnerCommand::Products => engine.list_products().map(|products| {
            let mut table = TableBuilder::new(&["Id", "Name", "Local name", "Category", "Unit"]);
            for product in products {
                table.add_row(vec![
                    product.id.to_string(),
                    product.name,
                    product.local_name.unwrap_or_default(),
                    product.category.unwrap_or_default(),
                    product.default_unit.unwrap_or_default(),
                ]);
            }
            if table.is_empty() {
                cli_style::print_empty_list("no canonical products yet");
            } else {
                table.print();
            }
        }),
        InnerCommand::AddCountry { iso_code, name } => engine
            .create_country(&iso_code, &name)
            .map(|c| cli_style::print_success(&format!("Created country {} ({})", c.id, c.iso_code))),
        InnerCommand::AddMarket {
            country_id,
            name,
            market_type,
        } => engine
            .create_market(country_id, &name, market_type.as_deref())
            .map(|m| cli_style::print_success(&format!("Created market {} ({})", m.id, m.name))),
        InnerCommand::AddProduct {
            name,
            local_name,
            category,
            default_unit,
        } => engine
            .create_product(&NewCanonicalProduct {
                name,
                local_name,
                category,
                default_unit,
            })
            .map(|p| cli_style::print_success(&format!("Created product {} ({})", p.id, p.name))),
        InnerCommand::AddVariety { product_id, name } => engine
            .create_variety(product_id, &name)
            .map(|v| cli_style::print_success(&format!("Created variety {} ({})", v.id, v.name))),
        InnerCommand::AddStage { code, name } => engine
            .create_price_stage(&code, &name)
            .map(|s| cli_style::print_success(&format!("Created price stage {} ({})", s.id, s.code))),
        InnerCommand::SeedStages => engine
            .seed_price_stages()
            .map(|n| cli_style::print_success(&format!("Created {} price stage(s)", n))),
        InnerCommand::Delete { kind, id } => engine
            .delete_canonical(kind, id)
            .map(|_| cli_style::print_success(&format!("Deleted {} {}", kind, id))),
        InnerCommand::Where => {
            cli_style::print_info(db_path);
            Ok(())
        }
        InnerCommand::Help => {
            cli_style::print_help(&command_help());
            Ok(())
        }
        InnerCommand::Exit => return CommandExecutionResult::Exit,
    };

    match outcome {
        Ok(()) => CommandExecutionResult::Ok,
        Err(err) => CommandExecutionResult::Error(err.to_string()),
    }
}

#[derive(rustyline_derive::Hinter)]
struct LinkHelper {
    commands_names: Vec<String>,
}

impl LinkHelper {
    pub fn new() -> Self {
        let commands_names: Vec<String> = InnerCli::command()
            .get_subcommands()
            .map(|sc| sc.get_name().to_string())
            .collect();

        LinkHelper { commands_names }
    }
}

impl Completer for LinkHelper {
    type Candidate = String;

    fn complete(
        &self,
        line: &str,
        _pos: usize,
        _ctx: &rustyline::Context<'_>,
    ) -> rustyline::Result<(usize, Vec<String>)> {
        if line.contains(' ') {
            return Ok((0, Vec::with_capacity(0)));
        }
        let matches = self
            .commands_names
            .iter()
            .filter(|c| c.starts_with(line))
            .cloned()
            .collect::<Vec<_>>();

        Ok((0, matches))
    }
}

impl Highlighter for LinkHelper {}
impl Validator for LinkHelper {}
impl Helper for LinkHelper {}

fn main() -> Result<()> {
    let cli_args = CliArgs::parse();
    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let config = AppConfig::resolve(
        &CliConfig {
            db_dir: cli_args.db_dir,
            ..Default::default()
        },
        file_config,
    )?;

    let db_path = config.catalog_db_path();
    let store = Arc::new(SqliteCatalogStore::new(&db_path)?);
    let engine = PriceEngine::new(store, &config.engine_settings());

    let unlinked = engine
        .list_unlinked(EntityKind::Product, &UnlinkedFilter::default())
        .map(|entities| entities.len())
        .unwrap_or(0);

    let rl_config = Config::builder()
        .completion_type(CompletionType::List)
        .build();

    let mut rl = Editor::<LinkHelper, FileHistory>::with_config(rl_config)?;
    rl.set_helper(Some(LinkHelper::new()));
    let _ = rl.clear_screen();

    let db_path_display = db_path.display().to_string();
    cli_style::print_welcome(&db_path_display, unlinked);

    loop {
        let readline = rl.readline(&cli_style::get_prompt());

        match readline {
            Ok(line) => {
                let _ = rl.add_history_entry(&line);
                match execute_command(line.trim().to_string(), &engine, &db_path_display) {
                    CommandExecutionResult::Ok => {}
                    CommandExecutionResult::Exit => {
                        break;
                    }
                    CommandExecutionResult::Error(err) => {
                        cli_style::print_error(&err);
                        continue;
                    }
                }
                cli_style::flush();
            }
            Err(rustyline::error::ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(rustyline::error::ReadlineError::Eof) => {
                println!("CTRL-D: exiting.");
                break;
            }
            Err(e) => {
                cli_style::print_error(&format!("{:?}", e));
                break;
            }
        }
    }
    cli_style::print_goodbye();
    Ok(())
}
