//! TETHER 클라이언트 바이너리 진입점.
//!
//! 설정 로드, 어댑터 DI 와이어링, 백그라운드 루프와 라이프사이클 관리.

use anyhow::Result;
use clap::Parser;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tether_client::offline_queue::DeferredQueue;
use tether_client::AppContext;
use tether_core::config::AppConfig;
use tether_core::config_manager::ConfigManager;
use tether_core::models::realtime::ChannelNotice;
use tether_core::ports::transport::Transport;
use tether_network::auth::TokenManager;
use tether_network::connectivity::ConnectivityManager;
use tether_network::http_transport::HttpTransport;
use tether_network::ws_client::WsConnector;
use tether_storage::sqlite::SqliteStorage;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tether_app::cache::QueryCache;
use tether_app::lifecycle::LifecycleManager;
use tether_app::notifier::{LogNotifier, NoticeLevel};
use tether_app::scheduler::{Scheduler, SchedulerConfig};

/// 쿼리 캐시 최대 항목 수
const QUERY_CACHE_CAPACITY: usize = 500;

/// 상태 보고 간격
const REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// TETHER 클라이언트
///
/// 오프라인 큐, 레이트 리밋, 실시간 동기화를 갖춘 API 요청 오케스트레이터
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 오프라인 모드로 실행 (변경 요청은 모두 로컬 큐에 저장)
    #[arg(long, short = 'o')]
    offline: bool,

    /// 서버 URL 지정 (기본: 설정 파일 값)
    #[arg(long, short = 's', env = "TETHER_SERVER")]
    server: Option<String>,

    /// 로그 레벨 (trace, debug, info, warn, error)
    #[arg(long, short = 'l', default_value = "info", env = "TETHER_LOG_LEVEL")]
    log_level: String,

    /// 설정 파일 경로 (기본: 플랫폼 설정 디렉토리의 config.json)
    #[arg(long, short = 'c', env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// 데이터 저장 경로 (오프라인 큐 DB)
    #[arg(long, env = "TETHER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// 실패한 지연 요청 목록 출력 후 종료
    #[arg(long)]
    list_failed: bool,

    /// 실패한 지연 요청을 다시 대기 상태로 (id)
    #[arg(long, value_name = "ID")]
    retry_failed: Option<String>,

    /// 지연 요청 삭제 (id)
    #[arg(long, value_name = "ID")]
    discard: Option<String>,
}

/// 데이터베이스 경로 결정 (CLI 인자 → 설정 파일 → 플랫폼별 기본 경로)
///
/// # 플랫폼별 기본 경로:
/// - macOS: `~/Library/Application Support/dev.tether.client/tether.db`
/// - Windows: `%APPDATA%\tether\client\data\tether.db`
/// - Linux: `~/.local/share/client/tether.db`
fn resolve_db_path(data_dir: Option<&Path>, configured: Option<&Path>) -> PathBuf {
    data_dir
        .map(|d| d.join("tether.db"))
        .or_else(|| configured.map(Path::to_path_buf))
        .or_else(|| {
            ProjectDirs::from("dev", "tether", "client").map(|p| p.data_dir().join("tether.db"))
        })
        .unwrap_or_else(|| PathBuf::from("./tether.db"))
}

/// 설정 로드 (실패 시 기본 설정)
fn load_config(path: Option<PathBuf>) -> AppConfig {
    let manager = match path {
        Some(path) => ConfigManager::open(path),
        None => ConfigManager::open_default(),
    };
    match manager {
        Ok(manager) => {
            info!("설정 파일: {}", manager.path().display());
            manager.current()
        }
        Err(e) => {
            warn!("설정 로드 실패, 기본 설정 사용: {e}");
            AppConfig::default_config()
        }
    }
}

/// 지연 요청 검토 명령 처리
/// 명령 처리 후 true 반환 (프로그램 종료), 명령 없으면 false 반환 (계속 실행)
async fn handle_queue_commands(args: &Args, queue: &DeferredQueue) -> Result<bool> {
    if args.list_failed {
        let failed = queue.failed_requests().await?;
        if failed.is_empty() {
            println!("실패한 지연 요청 없음");
        }
        for entry in failed {
            println!(
                "{}  {} {}  재시도 {}회  {}",
                entry.id,
                entry.method,
                entry.target,
                entry.retry_count,
                entry.last_error.as_deref().unwrap_or("-")
            );
        }
        return Ok(true);
    }

    if let Some(id) = &args.retry_failed {
        queue.retry_failed(id).await?;
        println!("다시 대기열에 추가됨: {id}");
        return Ok(true);
    }

    if let Some(id) = &args.discard {
        if queue.discard(id).await? {
            println!("삭제됨: {id}");
        } else {
            println!("해당 요청 없음: {id}");
        }
        return Ok(true);
    }

    Ok(false)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_filter = format!(
        "tether={},tether_app={},tether_client={},tether_core={},tether_network={},tether_storage={}",
        args.log_level,
        args.log_level,
        args.log_level,
        args.log_level,
        args.log_level,
        args.log_level
    );
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter)),
        )
        .init();

    info!("TETHER 클라이언트 시작");

    // 설정 로드 + CLI 오버라이드
    let mut config = load_config(args.config.clone());
    if let Some(ref server_url) = args.server {
        config.server.base_url = server_url.clone();
    }
    config.validate()?;
    if args.offline {
        info!("오프라인 모드: 변경 요청은 로컬 큐에 저장");
        config.features.enable_real_time_sync = false;
    } else {
        info!("서버: {}", config.server.base_url);
    }

    // ── 어댑터 생성 (DI 와이어링) ──

    // 1. 연결 상태
    let connectivity = Arc::new(ConnectivityManager::new(
        config.connectivity.offline_threshold,
    ));
    connectivity.set_force_offline(args.offline);

    // 2. 인증 (자격 증명이 있을 때만)
    let token_manager = Arc::new(TokenManager::new(&config.server.base_url));
    let mut authenticated = false;
    if !args.offline {
        if let Ok(password) = std::env::var("TETHER_PASSWORD") {
            let identifier = std::env::var("TETHER_IDENTIFIER").unwrap_or_default();
            info!("서버 로그인 시도: {identifier}");
            match token_manager.login(&identifier, &password).await {
                Ok(()) => authenticated = true,
                Err(e) => {
                    warn!("로그인 실패: {e}");
                    warn!("환경변수 TETHER_IDENTIFIER, TETHER_PASSWORD를 확인하세요.");
                }
            }
        }
    }

    // 3. REST 전송
    let mut http = HttpTransport::new(&config.server.base_url, config.request_timeout())?;
    if authenticated {
        http = http.with_token_supplier(token_manager.clone());
    }
    let transport: Arc<dyn Transport> = Arc::new(http);

    // 4. 실시간 채널 커넥터
    let mut connector = WsConnector::new(&config.server.base_url, &config.server.realtime_path);
    if authenticated {
        connector = connector.with_token_supplier(token_manager.clone());
    }

    // 5. 스토리지 (파일 기반 SQLite)
    let db_path = resolve_db_path(args.data_dir.as_deref(), config.storage.db_path.as_deref());
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let storage = Arc::new(SqliteStorage::open(&db_path)?);
    info!("SQLite 저장소: {}", db_path.display());

    // 6. 알림 + 쿼리 캐시
    let notifier = Arc::new(LogNotifier::default());
    let query_cache = Arc::new(QueryCache::new(QUERY_CACHE_CAPACITY));

    // 7. 컨텍스트 조립
    let ctx = AppContext::builder(config.clone())
        .transport(transport.clone())
        .store(storage)
        .connectivity(connectivity.clone())
        .notifier(notifier.clone())
        .connector(Arc::new(connector))
        .projection(query_cache.clone())
        .build()?;

    if handle_queue_commands(&args, ctx.queue()).await? {
        return Ok(());
    }

    // 실시간 채널 상태 로깅
    let _realtime_logs = ctx.realtime().map(|channel| {
        (
            channel.on_state_change(|state| info!("실시간 채널 상태: {state:?}")),
            channel.on_notice(|notice| match notice {
                ChannelNotice::ReconnectScheduled { attempt, delay_ms } => {
                    info!("실시간 채널 재연결 예약: {attempt}번째, {delay_ms}ms 후")
                }
                ChannelNotice::ReconnectExhausted { attempts } => {
                    error!("실시간 채널 재연결 {attempts}회 실패, 수동 재연결 필요")
                }
            }),
        )
    });

    // ── 태스크 시작 ──
    let lifecycle = LifecycleManager::new();
    let mut handles = ctx.start(lifecycle.subscribe());

    let sched = Scheduler::new(
        SchedulerConfig {
            probe_interval: config.probe_interval(),
            report_interval: REPORT_INTERVAL,
            health_path: config.server.health_path.clone(),
        },
        connectivity,
        transport,
        ctx.metrics().clone(),
        ctx.governor().clone(),
        ctx.queue().clone(),
    );
    let shutdown_rx = lifecycle.subscribe();
    handles.push(tokio::spawn(async move {
        sched.run(shutdown_rx).await;
    }));

    info!("TETHER 클라이언트 실행 중 (Ctrl+C로 종료)");

    // OS 시그널 대기
    lifecycle.wait_for_signal().await;

    if let Some(Err(e)) = ctx.realtime().map(|channel| channel.check_health()) {
        warn!("종료 시점 실시간 채널: {e}");
    }
    ctx.shutdown().await;
    for handle in handles {
        if let Err(e) = handle.await {
            warn!("백그라운드 태스크 종료 실패: {e}");
        }
    }

    let report = ctx.metrics().performance_report();
    info!(
        "성능 요약: 점수={}, 요청={}, 성공률={:.1}%",
        report.score,
        report.total_requests,
        report.success_rate * 100.0
    );
    let error_notices = notifier
        .history()
        .iter()
        .filter(|(level, _)| *level == NoticeLevel::Error)
        .count();
    info!(
        "세션 요약: 에러 알림={}, 캐시 항목={}",
        error_notices,
        query_cache.len()
    );
    info!("TETHER 클라이언트 종료");
    Ok(())
}
