//! Command dispatch

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use clap::CommandFactory;
use itertools::Itertools;
use serde_json::Value;
use termtree::Tree;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::cli::args::{Cli, Commands, ConfigCommands, NodeCommands, QuoteCommands, TypeCommands};
use crate::cli::error::{CliError, CliResult};
use crate::cli::output;
use crate::config::{global_config_path, local_config_path, Settings};
use crate::domain::{
    path, AttributeNode, Configuration, Impact, ManufacturingType, NodeId, NodeSpec, NodeTree,
    SelectionInput,
};
use crate::infrastructure::di::ServiceContainer;
use crate::infrastructure::InfraError;

pub fn execute_command(cli: &Cli) -> CliResult<()> {
    let project_dir = match &cli.project_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().map_err(|e| InfraError::io("current directory", e))?,
    };
    let mut settings = Settings::load(Some(&project_dir))?;
    if let Some(data_file) = &cli.data_file {
        settings.data_file = data_file.clone();
    }
    debug!("execute_command: data_file={}", settings.data_file.display());

    match &cli.command {
        Some(Commands::Config { command }) => _config(command, &settings, &project_dir),
        Some(Commands::Completion { shell }) => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(*shell, &mut cmd, name, &mut io::stdout());
            Ok(())
        }
        Some(Commands::Type { command }) => _type(command, &ServiceContainer::new(settings)?),
        Some(Commands::Node { command }) => _node(command, &ServiceContainer::new(settings)?),
        Some(Commands::Quote { command }) => _quote(command, &ServiceContainer::new(settings)?),
        None => Err(CliError::Usage("no command given, see --help".into())),
    }
}

fn _config(command: &ConfigCommands, settings: &Settings, project_dir: &Path) -> CliResult<()> {
    match command {
        ConfigCommands::Show => output::info(&settings.to_toml()?),
        ConfigCommands::Template => output::info(&Settings::template()),
        ConfigCommands::Path => {
            let global = global_config_path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(no config directory)".into());
            output::action("global", &global);
            output::action("local", &local_config_path(project_dir).display());
            output::action("data", &settings.data_file.display());
        }
    }
    Ok(())
}

#[instrument(level = "debug", skip(container))]
fn _type(command: &TypeCommands, container: &ServiceContainer) -> CliResult<()> {
    match command {
        TypeCommands::Add {
            name,
            base_price,
            base_weight,
            technical,
        } => {
            let mut manufacturing_type = ManufacturingType::new(name, *base_price, *base_weight);
            for assignment in technical {
                let (key, value) = parse_assignment(assignment)?;
                let number = value
                    .as_f64()
                    .ok_or_else(|| CliError::InvalidArgs(format!("{key}: technical value must be a number")))?;
                manufacturing_type
                    .base_technical_data
                    .insert(path::sanitize(&key), number);
            }
            container.catalog.put_manufacturing_type(manufacturing_type.clone())?;
            output::success(&format!("{} {}", manufacturing_type.name, manufacturing_type.id));
        }
        TypeCommands::List => {
            let types = container.catalog.list_manufacturing_types()?;
            for t in types.iter().sorted_by(|a, b| a.name.cmp(&b.name)) {
                output::info(&format!(
                    "{}  {:<24} base_price={:.2} base_weight={:.2}",
                    t.id, t.name, t.base_price, t.base_weight
                ));
            }
        }
    }
    Ok(())
}

#[instrument(level = "debug", skip(container))]
fn _node(command: &NodeCommands, container: &ServiceContainer) -> CliResult<()> {
    match command {
        NodeCommands::Import {
            manufacturing_type,
            file,
            parent,
        } => {
            let mt = resolve_type(container, manufacturing_type)?;
            let specs = read_specs(file)?;
            let parent = parent.as_deref().map(parse_id).transpose()?;
            let created = container
                .hierarchy
                .batch_create_from_nested(mt.id, &specs, parent)?;
            output::success(&format!("imported {} nodes into {}", created.len(), mt.name));
        }
        NodeCommands::Export {
            manufacturing_type,
            root,
            output: target,
        } => {
            let mt = resolve_type(container, manufacturing_type)?;
            let json = match root {
                Some(root) => {
                    let spec = container.hierarchy.export_nested(parse_id(root)?)?;
                    serde_json::to_string_pretty(&spec)
                }
                None => {
                    let specs = container.hierarchy.export_manufacturing_type(mt.id)?;
                    serde_json::to_string_pretty(&specs)
                }
            }
            .map_err(|e| CliError::Usage(format!("serialize export: {e}")))?;
            match target {
                Some(target) => {
                    std::fs::write(target, json)
                        .map_err(|e| InfraError::io(format!("write {}", target.display()), e))?;
                    output::success(&format!("exported to {}", target.display()));
                }
                None => output::info(&json),
            }
        }
        NodeCommands::Tree {
            manufacturing_type,
            ids,
        } => {
            let mt = resolve_type(container, manufacturing_type)?;
            let forest = container.hierarchy.build_tree(mt.id)?;
            let leaves: Vec<Tree<String>> = forest.iter().map(|t| to_display_tree(t, *ids)).collect();
            let root = format!("{} (base {:.2})", mt.name, mt.base_price);
            output::info(&Tree::new(root).with_leaves(leaves));
        }
        NodeCommands::Move { node, parent } => {
            let parent = parent.as_deref().map(parse_id).transpose()?;
            let moved = container.hierarchy.reparent(parse_id(node)?, parent)?;
            output::action("moved", &moved.materialized_path);
        }
        NodeCommands::Delete { node, cascade } => {
            let removed = container.hierarchy.delete(parse_id(node)?, *cascade)?;
            output::action("deleted", &format!("{removed} nodes"));
        }
    }
    Ok(())
}

#[instrument(level = "debug", skip(container))]
fn _quote(command: &QuoteCommands, container: &ServiceContainer) -> CliResult<()> {
    match command {
        QuoteCommands::Price {
            manufacturing_type,
            inputs,
            selections,
            save,
            json,
        } => {
            let mt = resolve_type(container, manufacturing_type)?;
            let inputs = inputs
                .iter()
                .map(|a| parse_assignment(a))
                .collect::<CliResult<BTreeMap<String, Value>>>()?;
            let nodes = container.hierarchy.build_tree(mt.id)?;
            let selections = selections
                .iter()
                .map(|s| parse_selection(s, &nodes))
                .collect::<CliResult<Vec<SelectionInput>>>()?;

            let config = if *save {
                let created = container.configurations.create(mt.id, BTreeMap::new())?;
                container
                    .configurations
                    .replace_selections(created.id, created.version, Some(inputs), selections)?
            } else {
                container.configurations.quote(mt.id, inputs, &selections)?
            };
            print_configuration(&config, *json)?;
            if *save {
                output::action("saved", &config.id);
            }
        }
        QuoteCommands::Show {
            configuration,
            json,
        } => {
            let config = container.configurations.get(parse_id(configuration)?)?;
            print_configuration(&config, *json)?;
        }
        QuoteCommands::Snapshot {
            configuration,
            quote_ref,
        } => {
            let snapshot = container
                .configurations
                .snapshot(parse_id(configuration)?, quote_ref.clone())?;
            output::success(&format!("snapshot {} total {:.2}", snapshot.id, snapshot.total_price));
            output::detail(&format!("checksum {}", snapshot.checksum));
        }
    }
    Ok(())
}

fn print_configuration(config: &Configuration, json: bool) -> CliResult<()> {
    if json {
        let text = serde_json::to_string_pretty(config)
            .map_err(|e| CliError::Usage(format!("serialize configuration: {e}")))?;
        output::info(&text);
        return Ok(());
    }

    output::header(&format!("Price ({:?})", config.state).to_lowercase());
    for line in &config.price_breakdown {
        output::delta(line.delta, &format!("{:?}", line.kind).to_lowercase(), &line.path);
    }
    output::action("total", &format!("{:.2}", config.total_price));
    output::action("weight", &format!("{:.2}", config.calculated_weight));
    for (property, value) in &config.calculated_technical_data {
        output::detail(&format!("{property} = {value}"));
    }
    for selection in config.selections.iter().filter(|s| !s.counted) {
        output::warning(&format!("{} is hidden and not counted", selection.path));
    }
    for issue in &config.issues {
        output::warning(&format!("{}: {}", issue.path, issue.message));
    }
    if !config.missing_required.is_empty() {
        output::warning(&format!("missing required: {}", config.missing_required.iter().join(", ")));
    }
    Ok(())
}

fn to_display_tree(tree: &NodeTree, ids: bool) -> Tree<String> {
    let node = &tree.node;
    let mut label = format!("{} [{}]", node.name, node.node_type);
    if let Some(impact) = &node.price_impact {
        label.push(' ');
        label.push_str(&describe_impact(impact));
    }
    if node.display_condition.is_some() {
        label.push_str(" (conditional)");
    }
    if ids {
        label.push_str(&format!(" {}", node.id));
    }
    Tree::new(label).with_leaves(tree.children.iter().map(|c| to_display_tree(c, ids)))
}

fn describe_impact(impact: &Impact) -> String {
    match impact {
        Impact::Fixed(v) => format!("{v:+.2}"),
        Impact::Percentage(v) => format!("{v:+}%"),
        Impact::Formula(f) => format!("= {f}"),
    }
}

fn resolve_type(container: &ServiceContainer, key: &str) -> CliResult<ManufacturingType> {
    if let Ok(id) = Uuid::parse_str(key) {
        return container
            .catalog
            .get_manufacturing_type(id)?
            .ok_or_else(|| CliError::InvalidArgs(format!("unknown manufacturing type {id}")));
    }
    let mut matches: Vec<ManufacturingType> = container
        .catalog
        .list_manufacturing_types()?
        .into_iter()
        .filter(|t| t.name.eq_ignore_ascii_case(key))
        .collect();
    match matches.len() {
        1 => Ok(matches.remove(0)),
        0 => Err(CliError::InvalidArgs(format!("unknown manufacturing type {key}"))),
        n => Err(CliError::InvalidArgs(format!("{n} manufacturing types are named {key}, use the id"))),
    }
}

fn parse_id(raw: &str) -> CliResult<Uuid> {
    Uuid::parse_str(raw.trim()).map_err(|_| CliError::InvalidArgs(format!("not an id: {raw}")))
}

/// `key=value`; the value is JSON if it parses, a string otherwise.
fn parse_assignment(raw: &str) -> CliResult<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| CliError::InvalidArgs(format!("expected KEY=VALUE, got {raw}")))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(CliError::InvalidArgs(format!("empty key in {raw}")));
    }
    Ok((key.to_string(), parse_value(value)))
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw.trim()).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// `NODE` or `NODE=VALUE`, where NODE is an id or a materialized path.
fn parse_selection(raw: &str, forest: &[NodeTree]) -> CliResult<SelectionInput> {
    let (key, value) = match raw.split_once('=') {
        Some((k, v)) => (k.trim(), Some(parse_value(v))),
        None => (raw.trim(), None),
    };
    let node_id = match Uuid::parse_str(key) {
        Ok(id) => id,
        Err(_) => find_by_path(forest, key)
            .ok_or_else(|| CliError::InvalidArgs(format!("unknown node {key}")))?,
    };
    debug!("parse_selection: {} -> {}", key, node_id);
    Ok(match value {
        Some(v) => SelectionInput::new(node_id, v),
        None => SelectionInput::option(node_id),
    })
}

fn find_by_path(forest: &[NodeTree], wanted: &str) -> Option<NodeId> {
    let separator = path::SEPARATOR.to_string();
    let wanted = wanted.split(path::SEPARATOR).map(path::sanitize).join(&separator);
    fn walk<'a>(trees: &'a [NodeTree], wanted: &str) -> Option<&'a AttributeNode> {
        trees.iter().find_map(|t| {
            if t.node.materialized_path == wanted {
                Some(&t.node)
            } else {
                walk(&t.children, wanted)
            }
        })
    }
    walk(forest, &wanted).map(|n| n.id)
}

fn read_specs(file: &Path) -> CliResult<Vec<NodeSpec>> {
    let content = std::fs::read_to_string(file)
        .map_err(|e| InfraError::io(format!("read {}", file.display()), e))?;
    let format_err = |e: serde_json::Error| InfraError::Format {
        path: file.to_path_buf(),
        message: e.to_string(),
    };
    let value: Value = serde_json::from_str(&content).map_err(format_err)?;
    let specs = match value {
        Value::Array(_) => serde_json::from_value(value).map_err(format_err)?,
        other => vec![serde_json::from_value(other).map_err(format_err)?],
    };
    Ok(specs)
}
