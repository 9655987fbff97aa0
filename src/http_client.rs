use std::time::Duration;

use reqwest::ClientBuilder;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn has_proxy_env() -> bool {
    [
        "HTTPS_PROXY",
        "https_proxy",
        "HTTP_PROXY",
        "http_proxy",
        "ALL_PROXY",
        "all_proxy",
    ]
    .iter()
    .any(|k| std::env::var(k).is_ok_and(|v| !v.trim().is_empty()))
}

/// 本机地址（嵌入服务、测试桩）以及 `GATEWAY_NO_PROXY_HOSTS` 中列出的主机不走代理
fn should_bypass_proxy_impl(url: &str, proxy_env_present: bool, extra_hosts: &str) -> bool {
    if !proxy_env_present {
        return false;
    }
    let Ok(u) = reqwest::Url::parse(url) else {
        return false;
    };
    let Some(host) = u.host_str() else {
        return false;
    };

    if matches!(host, "localhost" | "127.0.0.1" | "[::1]" | "::1") {
        return true;
    }
    extra_hosts
        .split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .any(|h| host == h || host.ends_with(&format!(".{}", h)))
}

pub fn should_bypass_proxy_for_url(url: &str) -> bool {
    let extra = std::env::var("GATEWAY_NO_PROXY_HOSTS").unwrap_or_default();
    should_bypass_proxy_impl(url, has_proxy_env(), &extra)
}

pub fn maybe_disable_proxy(builder: ClientBuilder, url: &str) -> ClientBuilder {
    if should_bypass_proxy_for_url(url) {
        builder.no_proxy()
    } else {
        builder
    }
}

/// 非流式调用：整体超时
pub fn client_for_url_with_timeout(
    url: &str,
    timeout: Duration,
) -> Result<reqwest::Client, reqwest::Error> {
    let builder = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT.min(timeout))
        .timeout(timeout);
    maybe_disable_proxy(builder, url).build()
}

/// 流式调用：只限制建连，读超时由调用方按空闲时间控制
pub fn streaming_client_for_url(url: &str) -> Result<reqwest::Client, reqwest::Error> {
    let builder = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT);
    maybe_disable_proxy(builder, url).build()
}
