//! Echo - server and client in one process.
//!
//! This demo shows:
//! - Building a server with a unary and a server-streaming handler
//! - Calling both from a `Channel`
//! - Reading response headers and trailers
//!
//! ```text
//! RUST_LOG=pipe_rpc=debug cargo run --example echo
//! ```

use pipe_rpc::transport::generate_pipe_path;
use pipe_rpc::{CallOptions, Channel, Metadata, MetadataEntry, Method, MethodType, Server, ServerCallContext};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug)]
struct EchoInput {
    message: String,
}

#[derive(Serialize, Deserialize, Debug)]
struct EchoOutput {
    echo: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let echo = Method::<EchoInput, EchoOutput>::msgpack(MethodType::Unary, "Demo", "Echo");
    let repeat = Method::<EchoInput, EchoOutput>::msgpack(MethodType::ServerStreaming, "Demo", "Repeat");
    let path = generate_pipe_path();

    let server = Server::builder(path.clone())
        .add_unary(&echo, |input: EchoInput, ctx| async move {
            ctx.add_response_trailer(MetadataEntry::text("handled-by", "echo"));
            Ok(EchoOutput { echo: input.message })
        })
        .add_server_streaming(&repeat, |input: EchoInput, responses, _ctx| async move {
            for i in 1..=3 {
                responses
                    .write(&EchoOutput {
                        echo: format!("{} #{}", input.message, i),
                    })
                    .await?;
            }
            Ok(())
        })
        .on_error(|e| eprintln!("server error: {e}"))
        .build();
    server.start()?;

    let channel = Channel::new(path);

    let mut headers = Metadata::new();
    headers.add("client", "echo-demo");
    let call = channel
        .async_unary(
            &echo,
            &EchoInput {
                message: "hello".into(),
            },
            CallOptions::new().headers(headers),
        )
        .await?;
    println!("unary: {:?}", call.response().await?);
    println!("trailers: {:?}", call.trailers()?);
    drop(call);

    let call = channel
        .server_streaming(
            &repeat,
            &EchoInput {
                message: "again".into(),
            },
            CallOptions::new(),
        )
        .await?;
    while let Some(output) = call.response_stream().next().await? {
        println!("stream: {:?}", output);
    }
    drop(call);

    server.shutdown().await;
    Ok(())
}
