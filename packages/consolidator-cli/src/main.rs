use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use consolidator_core::{
    attestation::AttestationClient,
    chain_operator::EvmOperator,
    store::{GroupStore, JsonFileStore, MemoryStore},
    ChainRegistry, Config, NewSignatureGroup, Orchestrator, SignatureGroup,
};
use ethers::types::Address;
use std::path::PathBuf;
use std::sync::Arc;
use tabled::{settings::Style, Table, Tabled};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 验证并解析配置文件
    ValidateConfig {
        /// 配置文件路径
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
    /// 启动整合服务，持续推进未完成的签名组
    Start {
        /// 配置文件路径
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
    /// 提交一个签名请求（JSON）
    Submit {
        /// 配置文件路径
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
        /// 签名请求文件
        #[arg(short, long, value_name = "FILE")]
        request: PathBuf,
        /// 立即执行直到终态
        #[arg(long)]
        execute: bool,
    },
    /// 查看签名组状态
    Status {
        /// 配置文件路径
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
        /// 签名组 id，省略时列出全部
        #[arg(short = 'g', long = "group")]
        id: Option<String>,
        /// 只列出该用户的签名组
        #[arg(long)]
        user: Option<Address>,
    },
    /// 查询各链代币余额
    Balances {
        /// 配置文件路径
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
        /// 持有者地址
        #[arg(short = 'a', long = "address")]
        owner: Address,
    },
}

#[derive(Tabled)]
struct GroupRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "状态")]
    status: String,
    #[tabled(rename = "源链")]
    sources: String,
    #[tabled(rename = "目标链")]
    destination: u64,
    #[tabled(rename = "总额")]
    total: String,
    #[tabled(rename = "错误")]
    error: String,
}

impl From<&SignatureGroup> for GroupRow {
    fn from(group: &SignatureGroup) -> Self {
        Self {
            id: group.id.clone(),
            status: format!("{:?}", group.status),
            sources: group
                .source_chain_ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(","),
            destination: group.destination_chain_id,
            total: group.total_amount.clone(),
            error: group.error_message.clone().unwrap_or_default(),
        }
    }
}

#[derive(Tabled)]
struct TransferRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "源链")]
    chain: u64,
    #[tabled(rename = "类型")]
    kind: String,
    #[tabled(rename = "金额")]
    amount: u64,
    #[tabled(rename = "状态")]
    status: String,
    #[tabled(rename = "交易")]
    tx_hash: String,
    #[tabled(rename = "Mint 交易")]
    mint_tx_hash: String,
    #[tabled(rename = "错误")]
    error: String,
}

fn hash_or_dash<T: std::fmt::Debug>(hash: Option<T>) -> String {
    hash.map(|h| format!("{:?}", h)).unwrap_or_else(|| "-".to_string())
}

fn print_group(group: &SignatureGroup) {
    println!("签名组 {}", group.id);
    println!("- 用户: {:?}", group.user_address);
    println!("- 收款地址: {:?}", group.target_address);
    println!("- 状态: {:?}", group.status);
    println!("- 总额: {} (目标链 {})", group.total_amount, group.destination_chain_id);
    println!("- 过期时间: {}", group.expiration_time);
    if let Some(message) = &group.error_message {
        println!("- 错误: {}", message);
    }

    let rows = group.transfer_logs.iter().map(|log| TransferRow {
        index: log.index,
        chain: log.source_chain_id,
        kind: format!("{:?}", log.transaction_type),
        amount: log.amount,
        status: format!("{:?}", log.status),
        tx_hash: hash_or_dash(log.tx_hash),
        mint_tx_hash: hash_or_dash(log.mint_tx_hash),
        error: log.error_message.clone().unwrap_or_default(),
    });
    println!("{}", Table::new(rows).with(Style::rounded()));
}

async fn open_store(config: &Config) -> Result<Arc<dyn GroupStore>> {
    Ok(match &config.storage.path {
        Some(path) => {
            info!("使用文件存储: {:?}", path);
            Arc::new(JsonFileStore::open(path).await?)
        }
        None => {
            warn!("未配置存储路径，签名组只保存在内存中");
            Arc::new(MemoryStore::new())
        }
    })
}

async fn build_orchestrator(config: &Config) -> Result<Arc<Orchestrator>> {
    let registry = Arc::new(ChainRegistry::from_config(&config.chains));
    let operator_key = config.operator_key();
    if operator_key.is_none() {
        warn!(
            "环境变量 {} 未设置，写交易将失败",
            config.orchestrator.operator_key_env
        );
    }

    let operator = EvmOperator::new(registry.clone(), operator_key.as_deref())?;
    let attestation = AttestationClient::new(&config.attestation)?;
    let store = open_store(config).await?;

    Ok(Arc::new(Orchestrator::new(
        registry,
        store,
        Arc::new(operator),
        Arc::new(attestation),
        config.orchestrator.clone(),
        config.burn.clone(),
    )))
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志，默认 info，可用 RUST_LOG 覆盖
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::ValidateConfig { config } => {
            info!("正在验证配置文件: {:?}", config);
            let config = Config::load(config)?;
            println!("配置文件验证成功!");
            println!("配置内容概要:");
            println!("- 支持的链:");
            for chain in &config.chains {
                println!("  - {} ({}): domain {}", chain.name, chain.chain_id, chain.domain);
                println!("    代币: {:?}", chain.token_address);
                println!("    代理合约: {:?}", chain.proxy_address);
                println!("    消息合约: {:?}", chain.message_transmitter_address);
            }
            println!("- 证明服务: {}", config.attestation.base_url);
            println!("  - 每秒请求上限: {}", config.attestation.max_requests_per_second);
            println!("- 轮询间隔: {}毫秒", config.orchestrator.poll_interval_ms);
            println!("- 扫描间隔: {}秒", config.orchestrator.scan_interval_secs);
            println!(
                "- 运营者私钥: {}",
                if config.operator_key().is_some() { "已设置" } else { "未设置" }
            );
            Ok(())
        }
        Commands::Start { config } => {
            info!("正在启动整合服务");
            info!("使用配置文件: {:?}", config);

            let config = Config::load(config)?;
            let orchestrator = build_orchestrator(&config).await?;
            info!("整合服务初始化成功，开始运行...");

            if let Err(e) = orchestrator.start().await {
                error!("整合服务异常退出: {}", e);
                return Err(e.into());
            }
            Ok(())
        }
        Commands::Submit { config, request, execute } => {
            let config = Config::load(config)?;
            let body = std::fs::read_to_string(&request)
                .with_context(|| format!("无法读取签名请求 {:?}", request))?;
            let request: NewSignatureGroup = serde_json::from_str(&body).context("签名请求格式错误")?;

            let orchestrator = build_orchestrator(&config).await?;
            let group = orchestrator.submit(request).await?;
            println!("签名组已创建: {}", group.id);

            if execute {
                let status = orchestrator.drive(&group.id).await?;
                info!("签名组 {} 执行结束: {:?}", group.id, status);
            } else if config.storage.path.is_none() {
                warn!("内存存储在进程退出后丢失，请配合 --execute 使用");
            }

            if let Some(group) = orchestrator.store().get_group(&group.id).await? {
                print_group(&group);
            }
            Ok(())
        }
        Commands::Status { config, id, user } => {
            let config = Config::load(config)?;
            let store = open_store(&config).await?;

            match id {
                Some(id) => match store.get_group(&id).await? {
                    Some(group) => print_group(&group),
                    None => println!("签名组不存在: {}", id),
                },
                None => {
                    let groups = match user {
                        Some(user) => store.groups_for_user(user).await?,
                        None => store.list_groups(&[]).await?,
                    };
                    let rows: Vec<GroupRow> = groups.iter().map(GroupRow::from).collect();
                    println!("{}", Table::new(rows).with(Style::rounded()));
                }
            }
            Ok(())
        }
        Commands::Balances { config, owner } => {
            let config = Config::load(config)?;
            let orchestrator = build_orchestrator(&config).await?;

            println!("{:?} 的余额:", owner);
            for (chain_id, balance) in orchestrator.balances(owner).await {
                let name = config
                    .get_chain_config(chain_id)
                    .map(|c| c.name.as_str())
                    .unwrap_or("unknown");
                match balance {
                    Ok(balance) => println!("- {} ({}): {}", name, chain_id, balance),
                    Err(e) => println!("- {} ({}): 查询失败 {}", name, chain_id, e),
                }
            }
            Ok(())
        }
    }
}
