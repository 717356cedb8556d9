//! Simple example of using reqwest-proxy-dispatch.

use reqwest_proxy_dispatch::{
    parse_proxy_list, Dispatcher, DispatcherConfig, Event, EventKind, ProxyTag, RequestLifecycle,
};
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = DispatcherConfig::builder()
        .request_timeout(Duration::from_secs(10))
        .default_tag("public")
        .build();
    let dispatcher = Dispatcher::new(config);

    println!("Loading proxies...");
    // one proxy per line, `host:port` or `socks5://host:port`
    let proxies = parse_proxy_list(
        "# local upstreams\n\
         127.0.0.1:3128\n\
         socks5://127.0.0.1:1080\n",
    );
    dispatcher
        .proxy_pool()
        .load([(ProxyTag::from("public"), proxies)]);

    dispatcher.register_listener(EventKind::PlainResponse, |n| {
        if let Event::PlainResponse { status, body } = &n.event {
            println!("[{}] {}: {}", n.request_id, status, body);
        }
    });
    dispatcher.register_listener(EventKind::Error, |n| {
        if let Event::Error { error } = &n.event {
            println!(
                "[{}] failed after {} retries: {}",
                n.request_id, n.lifecycle.retry_count, error
            );
        }
    });

    println!("Sending request...");
    let mut lifecycle = RequestLifecycle::get("ip", "https://httpbin.org/ip");
    lifecycle.random_proxied = true;
    lifecycle.metadata.insert("purpose".into(), "demo".into());
    let handle = dispatcher.launch(lifecycle)?;
    println!("Launched {}", handle.id());

    // retries run as separate tasks, so wait for the whole chain
    dispatcher.wait_idle().await;
    dispatcher.shutdown().await;

    let (records, tags) = dispatcher.proxy_pool().get_stats();
    println!("Pool holds {} proxies across {} tags", records, tags);
    Ok(())
}
