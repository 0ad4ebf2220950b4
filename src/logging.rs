// =========================
// logging.rs
// MilterEngine ログ出力マクロ定義
//
// 【このファイルで使う主なクレート】
// - chrono: 日時操作・整形（Local::now, format）
// - chrono-tz: タイムゾーン変換（既定はAsia::Tokyo、設定Log_timezoneで変更可）
// - lazy_static: ログ用タイムゾーンのプロセス全体共有
//
// 【役割】
// - printdaytimeln!: タイムスタンプ付きで標準出力にログを出すマクロ
// - debugdaytimeln!: 詳細ログ（設定Verbose yes のときだけ出力）
// =========================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use chrono_tz::Tz;
use lazy_static::lazy_static;

lazy_static! {
    // ログ出力用タイムゾーン（設定読込時に更新）
    static ref LOG_TIMEZONE: RwLock<Tz> = RwLock::new(chrono_tz::Asia::Tokyo);
}

// 詳細ログ出力の有無
static VERBOSE: AtomicBool = AtomicBool::new(false);

/// ログ出力用タイムゾーンを変更
pub fn set_timezone(tz: Tz) {
    if let Ok(mut guard) = LOG_TIMEZONE.write() {
        *guard = tz;
    }
}

pub fn timezone() -> Tz {
    LOG_TIMEZONE
        .read()
        .map(|guard| *guard)
        .unwrap_or(chrono_tz::Asia::Tokyo)
}

/// IANA名（例: "Asia/Tokyo", "UTC"）からタイムゾーンを取得
pub fn parse_timezone(name: &str) -> Option<Tz> {
    name.trim().parse::<Tz>().ok()
}

pub fn set_verbose(on: bool) {
    VERBOSE.store(on, Ordering::Relaxed);
}

pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

/// "[%Y/%m/%d %H:%M:%S]" 形式の現在時刻
pub fn log_timestamp() -> String {
    let now = chrono::Local::now().with_timezone(&timezone()); // 設定タイムゾーンの現在時刻
    now.format("[%Y/%m/%d %H:%M:%S]").to_string()
}

/// タイムスタンプ付きで標準出力にログを出すマクロ
///
/// # 使い方
/// printdaytimeln!("メッセージ: {}", val);
///
/// # 説明
/// - 設定されたタイムゾーン（既定JST）の現在時刻を先頭に付与して出力
/// - 可変引数でformat!と同様に使える
#[macro_export] // クレート全体で利用可能
macro_rules! printdaytimeln {
    ($($arg:tt)*) => {{ // 可変引数（format!と同じ）
        println!("{} {}", $crate::logging::log_timestamp(), format!($($arg)*)); // タイムスタンプ付きログ出力
    }};
}

/// 詳細ログ（コマンド受信ごと等）。Verbose無効時は何も出さない
#[macro_export]
macro_rules! debugdaytimeln {
    ($($arg:tt)*) => {{
        if $crate::logging::is_verbose() {
            $crate::printdaytimeln!($($arg)*);
        }
    }};
}
