// =========================
// init.rs
// MilterEngine 設定管理モジュール
//
// 【このファイルで使う主なクレート】
// - std: ファイル入出力（fs::read_to_string）、文字列処理（lines, trim, parse）
// - chrono-tz: ログ用タイムゾーン（Log_timezone）
// - crate::server / crate::client: 待受アドレス・接続ごとの処理設定
//
// 【役割】
// - サーバー設定（Listenアドレス、クライアントタイムアウト、交渉内容、ログ設定等）の読み込み
// - 設定ファイル(MilterEngine.conf)からConfig構造体を生成
// =========================

use std::path::Path;
use std::time::Duration;

use chrono_tz::Tz;

use crate::client::ClientSettings;
use crate::error::MilterError;
use crate::milter_command::{ActionFlags, ProtocolFlags};
use crate::negotiate::DrainPolicy;
use crate::packet::DEFAULT_MAX_PACKET_SIZE;
use crate::server::ListenAddr;

/// 既定の設定ファイル名
pub const DEFAULT_CONFIG_PATH: &str = "MilterEngine.conf";

/// サーバー設定情報構造体
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: ListenAddr,               // 待受アドレス（Listen）
    pub client_timeout: u64,              // クライアント無通信タイムアウト秒（Client_timeout, 0なら無制限）
    pub skip_steps: ProtocolFlags,        // 省略を要求する手順（Skip_steps）
    pub actions: ActionFlags,             // 使用する修正アクション（Actions）
    pub max_packet_size: usize,           // 受信パケット長上限（Max_packet_size）
    pub drain_reply: Option<DrainPolicy>, // 決定後の後続パケットの扱い（Drain_reply, Noneはauto）
    pub log_timezone: Tz,                 // ログのタイムゾーン（Log_timezone）
    pub verbose: bool,                    // 詳細ログ（Verbose）
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: ListenAddr::default(),
            client_timeout: 30,
            skip_steps: ProtocolFlags::empty(),
            actions: ActionFlags::ADD_HEADERS,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            drain_reply: None,
            log_timezone: chrono_tz::Asia::Tokyo,
            verbose: false,
        }
    }
}

impl Config {
    /// 接続ごとの処理設定へ変換
    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            actions: self.actions,
            skip_steps: self.skip_steps,
            drain_reply: self.drain_reply,
            max_packet_size: self.max_packet_size,
            client_timeout: (self.client_timeout > 0).then(|| Duration::from_secs(self.client_timeout)),
        }
    }

    /// ログ設定（タイムゾーン・詳細ログ）を反映
    pub fn apply_logging(&self) {
        crate::logging::set_timezone(self.log_timezone);
        crate::logging::set_verbose(self.verbose);
    }
}

/// 設定ファイルを読み込んでConfigを生成
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, MilterError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| MilterError::Config(format!("{} 読み込み失敗: {}", path.display(), e)))?;
    parse_config(&text)
}

/// 設定テキストからConfigを生成
///
/// # 説明
/// - 1行1設定（"キー 値"）。空行と#で始まる行は無視
/// - 未知のキーは無視、値の誤りはエラー
/// - Listen未指定時は[::]:8898、Client_timeout未指定時は30秒
pub fn parse_config(text: &str) -> Result<Config, MilterError> {
    let mut config = Config::default();
    for line in text.lines() {
        // 設定ファイル各行をループ
        let line = line.trim(); // 前後空白除去
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line
            .split_once(char::is_whitespace)
            .map(|(k, v)| (k, v.trim()))
            .unwrap_or((line, ""));
        match key.to_ascii_lowercase().as_str() {
            "listen" => config.listen = ListenAddr::parse(value)?,
            "client_timeout" => config.client_timeout = parse_number(key, value)?,
            "skip_steps" => config.skip_steps = parse_flags(key, value, ProtocolFlags::from_name)?,
            "actions" => config.actions = parse_flags(key, value, ActionFlags::from_name)?,
            "max_packet_size" => {
                let size: usize = parse_number(key, value)?;
                if size < 2 {
                    return Err(MilterError::Config(format!("{} が小さすぎる: {}", key, size)));
                }
                config.max_packet_size = size;
            }
            "drain_reply" => {
                config.drain_reply = DrainPolicy::from_name(value).ok_or_else(|| {
                    MilterError::Config(format!("{} は auto/silent/repeat のいずれか: {}", key, value))
                })?;
            }
            "log_timezone" => {
                config.log_timezone = crate::logging::parse_timezone(value)
                    .ok_or_else(|| MilterError::Config(format!("未知のタイムゾーン: {}", value)))?;
            }
            "verbose" => config.verbose = parse_bool(key, value)?,
            _ => {} // 未知のキーは無視
        }
    }
    Ok(config)
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, MilterError> {
    value
        .parse()
        .map_err(|_| MilterError::Config(format!("{} の値が数値でない: {:?}", key, value)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, MilterError> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "on" | "true" | "1" => Ok(true),
        "no" | "off" | "false" | "0" => Ok(false),
        _ => Err(MilterError::Config(format!("{} は yes/no: {:?}", key, value))),
    }
}

// カンマ区切りのフラグ名一覧（"none" または空で0）
fn parse_flags<T>(key: &str, value: &str, from_name: fn(&str) -> Option<T>) -> Result<T, MilterError>
where
    T: Default + std::ops::BitOrAssign,
{
    let mut flags = T::default();
    if value.eq_ignore_ascii_case("none") {
        return Ok(flags);
    }
    for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        flags |= from_name(name)
            .ok_or_else(|| MilterError::Config(format!("{} の未知の名前: {}", key, name)))?;
    }
    Ok(flags)
}
