use anyhow::{anyhow, Result};
use std::io::{Cursor, Read, Seek, SeekFrom};

struct WavInfo {
    fmt_content: Vec<u8>,
    data_size: u32,
}

fn scan_wav(bytes: &[u8]) -> Result<WavInfo> {
    let mut f = Cursor::new(bytes);

    let mut id = [0u8; 4];
    f.read_exact(&mut id)?;
    if &id != b"RIFF" {
        return Err(anyhow!("Not a RIFF file"));
    }

    // Skip File Size
    f.seek(SeekFrom::Current(4))?;

    f.read_exact(&mut id)?;
    if &id != b"WAVE" {
        return Err(anyhow!("Not a WAVE file"));
    }

    let mut fmt_content: Option<Vec<u8>> = None;
    let mut data_size: Option<u32> = None;

    loop {
        let mut chunk_id = [0u8; 4];
        let n = f.read(&mut chunk_id)?;
        if n == 0 {
            break;
        }
        if n < 4 {
            return Err(anyhow!("Unexpected EOF reading chunk ID"));
        }

        let mut size_buf = [0u8; 4];
        f.read_exact(&mut size_buf)?;
        let chunk_size = u32::from_le_bytes(size_buf);

        if &chunk_id == b"fmt " {
            let mut buf = vec![0u8; chunk_size as usize];
            f.read_exact(&mut buf)?;
            fmt_content = Some(buf);
        } else if &chunk_id == b"data" {
            data_size = Some(chunk_size);
            break;
        } else {
            f.seek(SeekFrom::Current(chunk_size as i64))?;
        }
    }

    Ok(WavInfo {
        fmt_content: fmt_content.ok_or_else(|| anyhow!("Missing fmt chunk"))?,
        data_size: data_size.ok_or_else(|| anyhow!("Missing data chunk"))?,
    })
}

fn wav_duration(bytes: &[u8]) -> Option<u64> {
    let info = scan_wav(bytes).ok()?;
    if info.fmt_content.len() < 12 {
        return None;
    }
    let byte_rate = u32::from_le_bytes([
        info.fmt_content[8],
        info.fmt_content[9],
        info.fmt_content[10],
        info.fmt_content[11],
    ]);
    if byte_rate == 0 {
        return None;
    }
    Some((info.data_size as f64 / byte_rate as f64).round() as u64)
}

const MPEG1_L3_KBPS: [u32; 15] = [
    0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320,
];
const MPEG2_L3_KBPS: [u32; 15] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];

fn id3v2_len(bytes: &[u8]) -> usize {
    if bytes.len() < 10 || &bytes[..3] != b"ID3" {
        return 0;
    }
    let size = ((bytes[6] as usize & 0x7f) << 21)
        | ((bytes[7] as usize & 0x7f) << 14)
        | ((bytes[8] as usize & 0x7f) << 7)
        | (bytes[9] as usize & 0x7f);
    let footer = if bytes[5] & 0x10 != 0 { 10 } else { 0 };
    10 + size + footer
}

/// Estimates duration from the first Layer III frame header, assuming constant bitrate.
fn mp3_duration(bytes: &[u8]) -> Option<u64> {
    let start = id3v2_len(bytes);
    let search_end = bytes.len().min(start + 64 * 1024);
    let window = bytes.get(start..search_end)?;

    let offset = window.windows(4).position(|h| {
        h[0] == 0xFF && h[1] & 0xE0 == 0xE0 && (h[1] >> 1) & 0x3 == 0x1 && h[2] >> 4 != 0xF
    })?;
    let header = &window[offset..offset + 4];

    let version = (header[1] >> 3) & 0x3;
    let bitrate_idx = (header[2] >> 4) as usize;
    let kbps = match version {
        3 => MPEG1_L3_KBPS[bitrate_idx],
        0 | 2 => MPEG2_L3_KBPS[bitrate_idx],
        _ => return None,
    };
    if kbps == 0 {
        return None;
    }
    let audio_bytes = (bytes.len() - start - offset) as f64;
    Some((audio_bytes * 8.0 / (kbps as f64 * 1000.0)).round() as u64)
}

/// Duration in whole seconds, for WAV and MP3 payloads. `None` when the format is unknown.
pub fn probe_duration_seconds(bytes: &[u8]) -> Option<u64> {
    if bytes.starts_with(b"RIFF") {
        wav_duration(bytes)
    } else {
        mp3_duration(bytes)
    }
}

/// `HH:MM:SS`, as podcast clients expect in `itunes:duration`.
pub fn format_duration(total_seconds: u64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}

/// Accepts `HH:MM:SS`, `MM:SS` or plain seconds.
pub fn parse_duration(text: &str) -> Option<u64> {
    let parts: Vec<&str> = text.trim().split(':').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    let mut total = 0u64;
    for part in parts {
        total = total * 60 + part.trim().parse::<u64>().ok()?;
    }
    Some(total)
}

pub fn mime_for_format(format: &str) -> &'static str {
    match format.to_ascii_lowercase().as_str() {
        "wav" => "audio/wav",
        "ogg" | "opus" => "audio/ogg",
        "m4a" | "aac" => "audio/mp4",
        _ => "audio/mpeg",
    }
}
