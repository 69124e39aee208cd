use anyhow::{Result, bail};
use console::style;

use super::Services;
use crate::core::config::LauncherConfig;
use crate::core::terminal::{print_header, print_info, print_success};
use crate::core::variants::VariantMapping;

pub(super) async fn run_variants_command(config: LauncherConfig, args: &[String]) -> Result<()> {
    let services = Services::open(config, true).await?;
    let registry = &services.registry;
    let sub_cmd = args.first().map(String::as_str).unwrap_or("list");
    match sub_cmd {
        "list" => {
            let mappings = registry.list().await?;
            if mappings.is_empty() {
                print_info("No variants configured. Add one with 'variants add NAME ID1 ID2'.");
                return Ok(());
            }
            print_header("Variants");
            for m in mappings {
                println!(
                    "  {:<24} {} {}",
                    style(&m.variant_name).bold(),
                    m.plate_id_1,
                    m.plate_id_2
                );
            }
            Ok(())
        }
        "add" => {
            let [_, name, id1, id2] = args else {
                bail!("usage: variants add NAME PLATE_ID_1 PLATE_ID_2");
            };
            registry.add(VariantMapping::new(name, id1, id2)).await?;
            print_success(&format!("Variant '{}' mapped to {} / {}", name, id1, id2));
            Ok(())
        }
        "import" => {
            let [_, file] = args else {
                bail!("usage: variants import FILE");
            };
            let count = registry.import(file).await?;
            print_success(&format!("Imported {} variant mapping(s) from {}", count, file));
            Ok(())
        }
        other => bail!("unknown variants command '{}'; expected list, add or import", other),
    }
}
