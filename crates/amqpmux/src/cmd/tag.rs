use std::fs;

use amqpmux_frame::{envelope_header, random_tagged, tag, CHECKSUM_HEADER_SIZE};
use serde::Serialize;

use crate::cmd::TagArgs;
use crate::exit::{checksum_error, io_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_json, print_pretty, print_raw, print_table, OutputFormat};

#[derive(Serialize)]
struct TagOutput {
    source: String,
    output: String,
    body_size: usize,
    envelope_size: usize,
    checksum: String,
}

pub fn run(args: TagArgs, format: OutputFormat) -> CliResult<i32> {
    let (source, envelope) = match (&args.file, args.random) {
        (_, Some(size)) => (
            format!("random:{size}"),
            random_tagged(size).map_err(|err| io_error("random body", err))?,
        ),
        (Some(path), None) => {
            let body =
                fs::read(path).map_err(|err| io_error(&format!("read {}", path.display()), err))?;
            let envelope = tag(&body).map_err(|err| checksum_error("tag", err))?;
            (path.display().to_string(), envelope)
        }
        (None, None) => return Err(CliError::new(USAGE, "a file or --random is required")),
    };

    let Some(output) = &args.output else {
        print_raw(&envelope);
        return Ok(SUCCESS);
    };
    fs::write(output, &envelope)
        .map_err(|err| io_error(&format!("write {}", output.display()), err))?;

    let (_, crc) = envelope_header(&envelope).unwrap_or_default();
    let out = TagOutput {
        source,
        output: output.display().to_string(),
        body_size: envelope.len() - CHECKSUM_HEADER_SIZE,
        envelope_size: envelope.len(),
        checksum: format!("{crc:#010x}"),
    };
    let rows = [
        ("Source", out.source.clone()),
        ("Output", out.output.clone()),
        ("Body size", out.body_size.to_string()),
        ("CRC-32", out.checksum.clone()),
    ];
    match format {
        OutputFormat::Json => print_json(&out),
        OutputFormat::Table => print_table(&rows),
        OutputFormat::Pretty => print_pretty("Tagged", &rows),
        OutputFormat::Raw => println!("{}", out.checksum),
    }
    Ok(SUCCESS)
}
