use std::io::{self, Write};

use anyhow::{Result, bail};
use chrono::{DateTime, Local};
use common::MountPolicy;
use tabwriter::TabWriter;

use super::PolicyCommand;
use crate::policy::{PolicyMap, PolicyStore};

pub fn execute(store: &PolicyStore, command: PolicyCommand) -> Result<()> {
    match command {
        PolicyCommand::List => {
            write_table(&store.get_all(), store.default_policy(), io::stdout())?;
        }
        PolicyCommand::Set { uuid, mode, name } => {
            let record = store.set_policy(&uuid, mode, name.as_deref())?;
            println!("{} ({}) -> {}", record.uuid, record.name, record.mode);
        }
        PolicyCommand::Delete { uuid } => {
            if !store.remove(&uuid)? {
                bail!("no policy recorded for {uuid}");
            }
            println!("removed {uuid}");
        }
        PolicyCommand::Default { mode: Some(mode) } => {
            store.set_default_policy(mode)?;
            println!("default policy set to {mode}");
        }
        PolicyCommand::Default { mode: None } => {
            println!("{}", store.default_policy());
        }
    }
    Ok(())
}

pub fn write_table(records: &PolicyMap, default: MountPolicy, out: impl Write) -> Result<()> {
    let mut content = String::new();
    for record in records.values() {
        let local: DateTime<Local> = DateTime::from(record.last_connected);
        content.push_str(&format!(
            "{}\t{}\t{}\t{}\n",
            record.uuid,
            record.name,
            record.mode,
            local.to_rfc3339_opts(chrono::SecondsFormat::Secs, false)
        ));
    }

    let mut tab_writer = TabWriter::new(out);
    writeln!(&mut tab_writer, "UUID\tNAME\tMODE\tLAST CONNECTED")?;
    write!(&mut tab_writer, "{content}")?;
    writeln!(&mut tab_writer, "(default)\t\t{default}\t")?;
    tab_writer.flush()?;
    Ok(())
}
