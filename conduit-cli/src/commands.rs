//! CLI subcommand handlers.

use crate::Commands;
use anyhow::Context;
use conduit_core::config::ConduitConfig;
use conduit_core::host::{ConnectionHost, ListenOptions};
use conduit_core::lifecycle::Lifecycle;
use conduit_core::transport::{ReconnectingTransport, SocketOptions, SocketTransport};
use conduit_core::TransportError;
use conduit_rpc::{CallContext, CallOptions, EngineOptions, HandlerError, MethodTable, RpcEngine};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, mut config: ConduitConfig) -> anyhow::Result<()> {
    match command {
        Commands::Serve {
            host,
            port,
            max_connections,
        } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if max_connections.is_some() {
                config.server.max_connections = max_connections;
            }
            config.validate().context("Configuration error")?;
            serve(config).await
        }
        Commands::Call {
            method,
            args,
            addr,
            timeout,
            notify,
            reconnect,
        } => {
            let addr = addr.unwrap_or_else(|| config.server.address());
            let mut options = CallOptions::new().args(args.iter().map(|arg| parse_arg(arg)));
            if let Some(secs) = timeout {
                let timeout = Duration::try_from_secs_f64(secs)
                    .with_context(|| format!("invalid timeout: {secs}"))?;
                options = options.timeout(timeout);
            }
            call(&config, &addr, &method, options, notify, reconnect).await
        }
        Commands::Config => {
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            print!("{rendered}");
            Ok(())
        }
    }
}

/// Parse a command-line argument as JSON, falling back to a plain string.
pub fn parse_arg(arg: &str) -> Value {
    serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.to_string()))
}

/// State shared by the built-in methods.
#[derive(Debug, Default)]
pub struct ServerApp {
    served: AtomicU64,
}

/// The methods exposed by `conduit serve`.
pub fn builtin_methods() -> anyhow::Result<MethodTable<ServerApp>> {
    let table = MethodTable::new()
        .register_sync("echo", |ctx: CallContext<ServerApp>| {
            ctx.app.served.fetch_add(1, Ordering::Relaxed);
            match ctx.args.len() {
                0 => Ok(Value::Null),
                1 => Ok(ctx.args[0].clone()),
                _ => Ok(Value::Array(ctx.args)),
            }
        })?
        .register_sync("ping", |ctx: CallContext<ServerApp>| {
            let served = ctx.app.served.fetch_add(1, Ordering::Relaxed) + 1;
            Ok(json!({"pong": true, "served": served}))
        })?
        .register_sync("sum", |ctx: CallContext<ServerApp>| {
            ctx.app.served.fetch_add(1, Ordering::Relaxed);
            let mut total = 0f64;
            for arg in &ctx.args {
                total += arg.as_f64().ok_or_else(|| {
                    HandlerError::failed(format!("sum expects numbers, got {arg}"))
                })?;
            }
            Ok(json!(total))
        })?;
    Ok(table)
}

async fn serve(config: ConduitConfig) -> anyhow::Result<()> {
    let app = Arc::new(ServerApp::default());
    let methods = builtin_methods()?;
    let socket_options = SocketOptions::from_config(&config.transport);
    let engine_options = EngineOptions::from_config(&config.rpc).with_app_id("conduit-serve");

    let factory = move || -> Result<Arc<SocketTransport>, TransportError> {
        let transport = Arc::new(SocketTransport::new(socket_options.clone()));
        RpcEngine::attach(
            Arc::clone(&app),
            transport.clone(),
            methods.clone(),
            engine_options.clone(),
        )?;
        Ok(transport)
    };

    let host = Lifecycle::new(ConnectionHost::new(
        ListenOptions::from_config(&config.server),
        factory,
    ));
    host.start().await.context("Failed to start the connection host")?;
    let running = host.run()?;
    if let Some(addr) = host.service().local_addr() {
        info!(addr = %addr, "Serving echo, ping and sum");
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            info!("Shutting down");
        }
        state = running.wait() => {
            warn!(state = %state, "Connection host stopped on its own");
        }
    }
    host.stop().await?;
    Ok(())
}

async fn call(
    config: &ConduitConfig,
    addr: &str,
    method: &str,
    options: CallOptions,
    notify: bool,
    reconnect: bool,
) -> anyhow::Result<()> {
    let socket_options = SocketOptions::from_config(&config.transport);
    let engine_options = EngineOptions::from_config(&config.rpc).with_app_id("conduit-call");

    let engine = if reconnect {
        let transport = Arc::new(ReconnectingTransport::new(
            addr,
            socket_options,
            config.reconnect.backoff(),
        ));
        let engine = RpcEngine::attach(
            Arc::new(()),
            transport.clone(),
            MethodTable::new(),
            engine_options,
        )?;
        transport
            .connect()
            .await
            .with_context(|| format!("Failed to connect to {addr}"))?;
        engine
    } else {
        let transport = Arc::new(SocketTransport::new(socket_options));
        let engine = RpcEngine::attach(
            Arc::new(()),
            transport.clone(),
            MethodTable::new(),
            engine_options,
        )?;
        transport
            .connect_to(addr)
            .await
            .with_context(|| format!("Failed to connect to {addr}"))?;
        engine
    };

    let outcome = if notify {
        engine.notify(method, options).await.map(|()| None)
    } else {
        engine.call(method, options).await.map(Some)
    };
    engine.stop(Some(Duration::from_secs(1))).await;

    if let Some(result) = outcome? {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::transport::ChannelTransport;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_arg() {
        assert_eq!(parse_arg("3"), json!(3));
        assert_eq!(parse_arg("[1, 2]"), json!([1, 2]));
        assert_eq!(parse_arg("\"quoted\""), json!("quoted"));
        assert_eq!(parse_arg("hello"), json!("hello"));
    }

    #[tokio::test]
    async fn test_builtin_methods() {
        let (client_side, server_side) = ChannelTransport::pair(8);
        let client_side = Arc::new(client_side);
        let server_side = Arc::new(server_side);
        let client = RpcEngine::attach(
            Arc::new(()),
            client_side.clone(),
            MethodTable::new(),
            EngineOptions::default(),
        )
        .unwrap();
        let _server = RpcEngine::attach(
            Arc::new(ServerApp::default()),
            server_side.clone(),
            builtin_methods().unwrap(),
            EngineOptions::default(),
        )
        .unwrap();
        client_side.connect().await.unwrap();
        server_side.connect().await.unwrap();

        let options = || CallOptions::new().timeout(Duration::from_secs(2));
        assert_eq!(
            client.call("echo", options().arg("hi")).await.unwrap(),
            json!("hi")
        );
        assert_eq!(
            client.call("sum", options().arg(1).arg(2.5)).await.unwrap(),
            json!(3.5)
        );
        let pong = client.call("ping", options()).await.unwrap();
        assert_eq!(pong["pong"], json!(true));
        assert_eq!(pong["served"], json!(3));

        let err = client
            .call("sum", options().arg("x"))
            .await
            .unwrap_err();
        assert!(err.exception().unwrap().message.contains("sum expects numbers"));
    }
}
