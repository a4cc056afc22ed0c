//! 설정 파일 관리.
//!
//! `config.json`을 읽어 검증한 뒤 메모리에 보관한다. 파일이 없으면 기본 설정을 기록한다.
//! 변경은 검증을 통과한 경우에만 임시 파일 + rename으로 교체 저장한다.

use crate::config::AppConfig;
use crate::error::CoreError;
use directories::ProjectDirs;
use parking_lot::RwLock;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CONFIG_FILE_NAME: &str = "config.json";

/// 설정 관리자
#[derive(Debug)]
pub struct ConfigManager {
    path: PathBuf,
    current: RwLock<AppConfig>,
}

impl ConfigManager {
    /// 플랫폼 설정 디렉토리의 `config.json` 사용
    ///
    /// - macOS: `~/Library/Application Support/dev.tether.client/`
    /// - Windows: `%APPDATA%\tether\client\config\`
    /// - Linux: `~/.config/client/`
    pub fn open_default() -> Result<Self, CoreError> {
        let dirs = ProjectDirs::from("dev", "tether", "client")
            .ok_or_else(|| CoreError::Config("홈 디렉토리를 찾을 수 없습니다".to_string()))?;
        Self::open(dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// 지정 경로 사용 (없으면 기본 설정으로 생성)
    pub fn open(path: PathBuf) -> Result<Self, CoreError> {
        let config = if path.exists() {
            read_config(&path)?
        } else {
            let config = AppConfig::default_config();
            write_config(&path, &config)?;
            info!("기본 설정 파일 생성: {}", path.display());
            config
        };
        config.validate()?;

        Ok(Self {
            path,
            current: RwLock::new(config),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 현재 설정 (복제본)
    pub fn current(&self) -> AppConfig {
        self.current.read().clone()
    }

    /// 설정 변경 후 저장
    ///
    /// 변경 결과가 검증에 실패하면 파일과 메모리 모두 그대로 둔다.
    pub fn modify<F>(&self, change: F) -> Result<AppConfig, CoreError>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut current = self.current.write();
        let mut next = current.clone();
        change(&mut next);
        next.validate()?;
        write_config(&self.path, &next)?;
        *current = next.clone();
        debug!("설정 저장: {}", self.path.display());
        Ok(next)
    }

    /// 파일에서 다시 읽기 (외부 편집 반영)
    pub fn reload(&self) -> Result<AppConfig, CoreError> {
        let config = read_config(&self.path)?;
        config.validate()?;
        *self.current.write() = config.clone();
        info!("설정 다시 로드: {}", self.path.display());
        Ok(config)
    }
}

fn read_config(path: &Path) -> Result<AppConfig, CoreError> {
    let content = fs::read_to_string(path)
        .map_err(|e| CoreError::Config(format!("설정 파일 읽기 실패: {}: {}", path.display(), e)))?;
    serde_json::from_str(&content)
        .map_err(|e| CoreError::Config(format!("설정 파일 파싱 실패: {}: {}", path.display(), e)))
}

fn write_config(path: &Path, config: &AppConfig) -> Result<(), CoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| {
            CoreError::Config(format!("설정 디렉토리 생성 실패: {}: {}", parent.display(), e))
        })?;
    }

    let content = serde_json::to_string_pretty(config)?;
    let staging = path.with_extension("json.tmp");
    fs::write(&staging, content)
        .and_then(|_| fs::rename(&staging, path))
        .map_err(|e| CoreError::Config(format!("설정 파일 저장 실패: {}: {}", path.display(), e)))
}
