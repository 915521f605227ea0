//! Firmware info command implementation.

use {
    super::load_firmware,
    anyhow::Result,
    console::style,
    fcflash::{FirmwareImage, image::config::find_defaults_area},
    rust_i18n::t,
    std::path::Path,
};

fn info_json(image: &FirmwareImage) -> serde_json::Value {
    let blocks: Vec<serde_json::Value> = image
        .blocks()
        .iter()
        .map(|block| {
            serde_json::json!({
                "address": block.address,
                "end": block.end_address(),
                "length": block.len(),
            })
        })
        .collect();
    let area = find_defaults_area(image).map(|area| {
        serde_json::json!({
            "start": area.start,
            "end": area.end,
            "length": area.len(),
        })
    });

    serde_json::json!({
        "ok": true,
        "data": {
            "blocks": blocks,
            "bytes_total": image.bytes_total(),
            "start_linear_address": image.start_linear_address(),
            "custom_defaults_area": area,
            "custom_defaults_inserted": image.config_inserted(),
        }
    })
}

/// Info command implementation.
pub(crate) fn cmd_info(firmware: &Path, json: bool, custom_defaults: Option<&Path>) -> Result<()> {
    // In JSON mode stderr stays quiet apart from errors.
    let image = load_firmware(firmware, custom_defaults.map(|p| (p, false)), json)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info_json(&image))?);
        return Ok(());
    }

    eprintln!(
        "{}",
        style(t!("info.header", path = firmware.display()))
            .bold()
            .underlined()
    );
    eprintln!();

    for (index, block) in image.blocks().iter().enumerate() {
        eprintln!(
            "  {} #{index:<2} 0x{:08X}..0x{:08X} ({} bytes)",
            style("•").dim(),
            block.address,
            block.end_address(),
            block.len()
        );
    }
    eprintln!();
    eprintln!("  {}: {}", t!("info.total"), image.bytes_total());

    match image.start_linear_address() {
        Some(entry) => eprintln!("  {}: 0x{entry:08X}", t!("info.entry")),
        None => eprintln!("  {}: {}", t!("info.entry"), style("-").dim()),
    }

    match find_defaults_area(&image) {
        Some(area) => eprintln!(
            "  {}: 0x{:08X}..0x{:08X} ({} bytes){}",
            t!("info.defaults_area"),
            area.start,
            area.end,
            area.len(),
            if image.config_inserted() {
                format!(" {}", style(t!("info.defaults_inserted")).green())
            } else {
                String::new()
            }
        ),
        None => eprintln!(
            "  {}: {}",
            t!("info.defaults_area"),
            style(t!("info.none")).dim()
        ),
    }

    Ok(())
}
