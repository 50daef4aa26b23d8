use chrono::{DateTime, Local};
use clap::Args;
use comfy_table::presets::NOTHING;
use comfy_table::{Cell, Table};

#[derive(Args, Debug)]
pub struct ImagesArgs {
    /// Only print image ids
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: ImagesArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let runtime = global.create_runtime()?;
    let images = runtime.images().list().await;

    if args.quiet {
        for (_, record) in &images {
            println!("{}", short_id(&record.image_id));
        }
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(NOTHING);
    table.set_header(vec!["TAG", "IMAGE ID", "LAYERS", "CREATED"]);

    for (tag, record) in &images {
        table.add_row(vec![
            Cell::new(tag),
            Cell::new(short_id(&record.image_id)),
            Cell::new(record.layers.len()),
            Cell::new(format_created(&record.created_at)),
        ]);
    }

    println!("{table}");
    Ok(())
}

/// First 12 hex digits of an image id.
fn short_id(image_id: &str) -> &str {
    let hex = image_id.strip_prefix("sha256:").unwrap_or(image_id);
    &hex[..hex.len().min(12)]
}

fn format_created(created_at: &str) -> String {
    DateTime::parse_from_rfc3339(created_at)
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|_| created_at.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("sha256:0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_format_created_keeps_unparseable_values() {
        assert_eq!(format_created("yesterday"), "yesterday");
        assert_eq!(format_created("2024-01-02T03:04:05+00:00").len(), 19);
    }
}
