// =========================
// lib.rs
// MilterEngine ライブラリ本体（Milterプロトコルエンジン）
//
// 【このファイルで使う主なクレート】
// - logging: タイムスタンプ付きログ出力マクロ（printdaytimeln! / debugdaytimeln!）
// - 各モジュール: パケット・交渉・セッション・修正アクション・接続処理
//
// 【役割】
// - モジュール構成の定義と主要な型の再公開
// - フィルタ本体は Milter トレイトを実装し、Server に生成関数を渡して使う
// =========================

#[macro_use]
pub mod logging; // タイムスタンプ付きログ出力（他モジュールより先に宣言）

pub mod client; // クライアント1接続ごとの処理
pub mod context; // コールバックに渡す文脈
pub mod error; // エラー定義
pub mod handler; // フィルタ処理のコールバック（Milterトレイト）
pub mod init; // 設定ファイル管理
pub mod macros; // マクロ保持
pub mod milter; // Milterコマンドごとのペイロード分解
pub mod milter_command; // Milterコマンド・応答・フラグ定義
pub mod modifier; // 修正アクション
pub mod negotiate; // オプション交渉
pub mod packet; // パケット送受信
pub mod parse; // 同梱フィルタ（メールデコード・ログ出力）
pub mod response; // 応答（決定）
pub mod server; // 接続受付サーバ
pub mod session; // セッション状態機械

pub use client::{handle_client, ClientSettings};
pub use context::{Context, HeaderList};
pub use error::{ErrorKind, MilterError};
pub use handler::Milter;
pub use milter::AddressFamily;
pub use milter_command::{ActionFlags, ProtocolFlags};
pub use modifier::ModifyAction;
pub use negotiate::{DrainPolicy, FeatureMask, Negotiator};
pub use packet::Packet;
pub use response::Response;
pub use server::{ListenAddr, Server};
pub use session::{Phase, Session, Step};
