//! HTML pages served by `/qr`.

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use qrcode::render::svg;
use qrcode::QrCode;

const PAGE_STYLE: &str = "font-family:sans-serif;text-align:center";

pub fn already_authenticated_page() -> String {
    page(
        "<h2>Already authenticated ✅</h2><p>You can close this page.</p>",
    )
}

pub fn waiting_page() -> String {
    page("<h2>QR not generated yet…</h2><p>Refresh in a few seconds.</p>")
}

/// Page embedding the challenge as an SVG QR code data URL.
pub fn challenge_page(payload: &str) -> Result<String> {
    let data_url = svg_data_url(payload)?;
    Ok(page(&format!(
        "<h2>Scan this QR with WhatsApp</h2>\
         <img src=\"{data_url}\" alt=\"QR\" style=\"width:320px;height:320px\"/>\
         <p>If it expires, refresh the page.</p>"
    )))
}

/// Encode a challenge payload as `data:image/svg+xml;base64,...`.
pub fn svg_data_url(payload: &str) -> Result<String> {
    let payload = payload.trim();
    if payload.is_empty() {
        anyhow::bail!("QR payload is empty");
    }

    let code = QrCode::new(payload.as_bytes())
        .map_err(|err| anyhow!("Failed to encode QR payload: {err}"))?;
    let image = code
        .render::<svg::Color<'_>>()
        .min_dimensions(320, 320)
        .quiet_zone(true)
        .build();

    Ok(format!(
        "data:image/svg+xml;base64,{}",
        STANDARD.encode(image.as_bytes())
    ))
}

fn page(body: &str) -> String {
    format!("<html><body style=\"{PAGE_STYLE}\">{body}</body></html>")
}
