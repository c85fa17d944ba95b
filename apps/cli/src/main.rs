use std::{io::Write, path::Path};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use time::OffsetDateTime;
use tokio::io::{AsyncBufReadExt, BufReader};

use chatrelay_core_sdk::{
    config::ServerConfig,
    consumer::StreamObserver,
    images::{self, ImageFormat},
    providers::{ProviderId, ProviderRegistry},
    quota::{self, GenerationQuota, QuotaDecision},
    server,
    session::{ChatSession, CredentialStore},
    telemetry,
    wire::WireFormat,
};

const DEFAULT_RELAY: &str = "http://127.0.0.1:5173";
const QUOTA_FILE: &str = "chatrelay-quota.json";

/**
 * \brief CLI 程序入口：启动中继，或作为客户端聊天/生成图片。
 */
#[derive(Parser, Debug)]
#[command(name = "chatrelay", version, about = "Streaming chat relay for xAI and DeepSeek")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 启动本地 HTTP 服务并提供前端页面。
     */
    Serve {
        /** 监听地址，缺省取 CHATRELAY_ADDR 或 127.0.0.1:5173 */
        #[arg(long)]
        addr: Option<String>,
        #[arg(long, default_value_t = false)]
        telemetry: bool,
    },

    /**
     * \brief 列出内置 Provider 与模型。
     */
    Providers,

    /**
     * \brief 通过中继聊天；不带 --prompt 时进入交互模式（/clear 清空，/exit 退出）。
     */
    Chat {
        #[arg(long, default_value = DEFAULT_RELAY)]
        relay: String,
        #[arg(long, default_value = "xai")]
        provider: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long)]
        system: Option<String>,
        /** 推理强度，如 low / high */
        #[arg(long)]
        reasoning: Option<String>,
        #[arg(long)]
        max_tokens: Option<i64>,
        #[arg(long)]
        temperature: Option<f32>,
        /** event-stream 或 raw-text */
        #[arg(long)]
        wire_format: Option<String>,
        #[arg(long, default_value_t = false)]
        no_stream: bool,
        #[arg(long)]
        api_key: Option<String>,
    },

    /**
     * \brief 通过中继生成图片（本地每日计数仅作提示）。
     */
    Image {
        #[arg(long, default_value = DEFAULT_RELAY)]
        relay: String,
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value_t = 1)]
        n: u32,
        /** url 或 b64_json */
        #[arg(long, default_value = "url")]
        format: String,
        /** 解锁口令，正确时进入无限模式 */
        #[arg(long)]
        unlock: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
    },
}

/**
 * \brief 终端输出：增量即时打印，推理内容走 stderr。
 */
#[derive(Default)]
struct TerminalObserver {
    reasoning_started: bool,
}

impl StreamObserver for TerminalObserver {
    fn on_increment(&mut self, increment: &str, _buffer: &str) {
        if self.reasoning_started {
            eprintln!();
            self.reasoning_started = false;
        }
        print!("{}", increment);
        std::io::stdout().flush().ok();
    }

    fn on_error(&mut self, _message: &str) {
        println!();
    }

    fn on_complete(&mut self, _text: &str) {
        println!();
    }

    fn on_reasoning(&mut self, increment: &str) {
        if !self.reasoning_started {
            eprint!("[reasoning] ");
            self.reasoning_started = true;
        }
        eprint!("{}", increment);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let env_config = ServerConfig::from_env();
    telemetry::init(env_config.telemetry, env_config.log_dir.clone());

    match cli.command {
        Commands::Serve { addr, telemetry } => {
            let mut config = env_config;
            if let Some(addr) = addr {
                config.addr = addr;
            }
            config.telemetry |= telemetry;
            server::run(config).await?;
        }
        Commands::Providers => {
            for provider in ProviderRegistry::builtin().iter() {
                println!(
                    "{} ({}) base={} default={} streaming={}",
                    provider.id,
                    provider.name,
                    provider.base_url,
                    provider.default_model,
                    provider.supports_streaming
                );
                for model in &provider.models {
                    println!(
                        "  - {} [{}] context={}{}",
                        model.id,
                        model.name,
                        model.context_size,
                        if model.supports_reasoning { " reasoning" } else { "" }
                    );
                }
            }
        }
        Commands::Chat {
            relay,
            provider,
            model,
            prompt,
            system,
            reasoning,
            max_tokens,
            temperature,
            wire_format,
            no_stream,
            api_key,
        } => {
            let provider: ProviderId = provider.parse()?;
            let mut credentials = CredentialStore::from_env();
            if let Some(key) = api_key {
                credentials.set(provider, key);
            }
            if credentials.get(provider).is_none() {
                bail!(
                    "no API key for {}; pass --api-key or set CHATRELAY_{}_API_KEY",
                    provider,
                    provider.as_str().to_ascii_uppercase()
                );
            }

            let mut session = ChatSession::new(relay, provider);
            session.model = model;
            session.options.reasoning_effort = reasoning;
            session.options.max_tokens = max_tokens;
            session.options.temperature = temperature;
            session.options.stream = !no_stream;
            session.wire_format = wire_format
                .as_deref()
                .map(str::parse::<WireFormat>)
                .transpose()?;
            if let Some(system) = system {
                session.push_system(system);
            }

            match prompt {
                Some(prompt) => {
                    telemetry::log_event(
                        "cli.chat",
                        &format!("provider={} prompt_len={}", provider, prompt.len()),
                    );
                    session
                        .send(&credentials, &prompt, &mut TerminalObserver::default())
                        .await
                        .context("chat failed")?;
                }
                None => repl(&mut session, &credentials).await?,
            }
        }
        Commands::Image {
            relay,
            prompt,
            n,
            format,
            unlock,
            api_key,
        } => {
            let format = match format.as_str() {
                "url" => ImageFormat::Url,
                "b64_json" => ImageFormat::B64Json,
                other => bail!("unknown image format: {}", other),
            };
            let mut credentials = CredentialStore::from_env();
            if let Some(key) = api_key {
                credentials.set(ProviderId::Xai, key);
            }
            let key = credentials
                .get(ProviderId::Xai)
                .context("no xAI API key; pass --api-key or set CHATRELAY_XAI_API_KEY")?
                .to_string();

            let path = Path::new(QUOTA_FILE);
            let now = OffsetDateTime::now_utc();
            let mut counter = GenerationQuota::load(path, now)?;
            if let Some(attempt) = unlock {
                let secret = std::env::var("CHATRELAY_UNLOCK_SECRET")
                    .unwrap_or_else(|_| quota::DEFAULT_UNLOCK_SECRET.to_string());
                if counter.unlock(&attempt, &secret) {
                    println!("Unlimited mode enabled.");
                } else {
                    println!("Incorrect unlock code.");
                }
            }

            match counter.check(now) {
                QuotaDecision::Locked { until_ms, extended } => {
                    counter.save(path)?;
                    if extended {
                        println!("Daily limit reached. Each attempt extends the wait by 12 hours.");
                    }
                    bail!(
                        "image generation locked for {}",
                        quota::format_remaining(until_ms, now)
                    );
                }
                QuotaDecision::Allowed { remaining } => {
                    if let Some(remaining) = remaining {
                        println!("{} of {} generations left today", remaining, quota::DAILY_LIMIT);
                    }
                }
            }

            telemetry::log_event("cli.image", &format!("n={} prompt_len={}", n, prompt.len()));
            let http = reqwest::Client::new();
            let generated = images::request_images(&http, &relay, &key, &prompt, n, format)
                .await
                .context("image generation failed")?;
            counter.record(generated.len() as u32, OffsetDateTime::now_utc());
            counter.save(path)?;

            for (i, image) in generated.iter().enumerate() {
                if let Some(url) = &image.url {
                    println!("[{}] {}", i + 1, url);
                } else if let Some(b64) = &image.b64_json {
                    println!("[{}] <base64 image, {} bytes>", i + 1, b64.len());
                }
                if let Some(revised) = &image.revised_prompt {
                    println!("    revised prompt: {}", revised);
                }
            }
        }
    }

    Ok(())
}

/**
 * \brief 交互式聊天；失败的一轮不会写入会话，可直接重试。
 */
async fn repl(session: &mut ChatSession, credentials: &CredentialStore) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();
        let Some(line) = lines.next_line().await? else {
            break;
        };
        match line.trim() {
            "" => continue,
            "/exit" | "/quit" => break,
            "/clear" => {
                session.clear();
                println!("(conversation cleared)");
            }
            text => {
                if let Err(e) = session
                    .send(credentials, text, &mut TerminalObserver::default())
                    .await
                {
                    eprintln!("error: {}", e);
                    telemetry::log_error("cli.chat", &e.to_string());
                }
            }
        }
    }
    Ok(())
}
