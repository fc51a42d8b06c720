use std::fs;

use amqpmux_frame::{envelope_header, verify};
use serde::Serialize;
use tracing::warn;

use crate::cmd::VerifyArgs;
use crate::exit::{checksum_error, io_error, CliResult, SUCCESS};
use crate::output::{print_json, print_pretty, print_raw, print_table, OutputFormat};

#[derive(Serialize)]
struct VerifyOutput {
    file: String,
    body_size: usize,
    checksum: String,
    valid: bool,
}

pub fn run(args: VerifyArgs, format: OutputFormat) -> CliResult<i32> {
    let path = args.file.display().to_string();
    let envelope = fs::read(&args.file).map_err(|err| io_error(&format!("read {path}"), err))?;

    let body = verify(&envelope).map_err(|err| {
        warn!(file = %path, error = %err, "envelope rejected");
        checksum_error(&format!("verify {path}"), err)
    })?;

    if let Some(extract) = &args.extract {
        fs::write(extract, body)
            .map_err(|err| io_error(&format!("write {}", extract.display()), err))?;
    }

    let (_, crc) = envelope_header(&envelope).unwrap_or_default();
    let out = VerifyOutput {
        file: path,
        body_size: body.len(),
        checksum: format!("{crc:#010x}"),
        valid: true,
    };
    let rows = [
        ("File", out.file.clone()),
        ("Body size", out.body_size.to_string()),
        ("CRC-32", out.checksum.clone()),
        ("Valid", out.valid.to_string()),
    ];
    match format {
        OutputFormat::Json => print_json(&out),
        OutputFormat::Table => print_table(&rows),
        OutputFormat::Pretty => print_pretty("Envelope", &rows),
        OutputFormat::Raw => print_raw(body),
    }
    Ok(SUCCESS)
}
