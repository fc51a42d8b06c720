//! Consume from a queue and verify each body's checksum envelope.
//!
//! Run against a local broker with:
//!   cargo run --example consume -- jobs

use std::time::Duration;

use amqpmux::client::ClientError;
use amqpmux::frame::{verify, ArgWriter, FieldTable, Method, MethodId};
use amqpmux::{dial, ConnectionConfig};

const BASIC_CONSUME: MethodId = MethodId::new(60, 20);
const BASIC_ACK: MethodId = MethodId::new(60, 80);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let queue = std::env::args().nth(1).unwrap_or_else(|| "jobs".to_string());

    let conn = dial(&ConnectionConfig::new("127.0.0.1", 5672))?;
    let channel = conn.open_channel()?;

    let mut args = ArgWriter::new();
    args.u16(0);
    args.short_str(&queue)?.short_str("")?;
    args.bits(&[false, false, false, false]);
    args.table(&FieldTable::new())?;
    let reply = channel.call(Method::new(BASIC_CONSUME, args.finish()))?;
    eprintln!("[consume] subscribed: {:?}", reply.method.id());

    loop {
        let delivery = match channel.receive_timeout(Duration::from_secs(5)) {
            Ok(delivery) => delivery,
            Err(ClientError::Timeout(_)) => break,
            Err(err) => return Err(err.into()),
        };
        match verify(&delivery.body) {
            Ok(body) => eprintln!("[consume] {} bytes ok", body.len()),
            Err(err) => eprintln!("[consume] corrupt body: {err}"),
        }
        if let Some(tag) = delivery.delivery_tag {
            let mut ack = ArgWriter::new();
            ack.u64(tag).bits(&[false]);
            channel.send(&Method::new(BASIC_ACK, ack.finish()))?;
        }
    }

    channel.close("done")?;
    conn.close("done")?;
    Ok(())
}
