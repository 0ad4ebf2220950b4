// =========================
// client.rs
// MilterEngine クライアント接続処理モジュール
//
// 【このファイルで使う主なクレート】
// - tokio: 非同期I/O・ブロードキャスト・タイムアウト（io::AsyncWriteExt, sync::broadcast, time::timeout）
// - crate::packet: パケット受信・送信（read_packet / write_packet）
// - crate::session: セッション状態機械（Session）
// - crate::handler: フィルタ本体（Milter）
// - crate::printdaytimeln!: タイムスタンプ付きログ出力マクロ
//
// 【役割】
// - クライアント1接続ごとのMilterプロトコル非同期処理
// - パケット受信 → セッション処理 → 応答送信 を1パケットずつ順番に繰り返す
// - タイムアウト・エラー・シャットダウン通知での終了、終了時のdisconnect呼び出し
// =========================

use std::time::Duration;

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt}, // 非同期I/Oトレイト
    sync::broadcast,                            // 非同期ブロードキャストチャンネル
};

use crate::error::MilterError;
use crate::handler::Milter;
use crate::milter_command::{ActionFlags, ProtocolFlags};
use crate::negotiate::{DrainPolicy, Negotiator};
use crate::packet::{read_packet, write_packet, Packet, DEFAULT_MAX_PACKET_SIZE};
use crate::session::Session;

/// 接続ごとの処理設定（設定ファイルから作る）
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub actions: ActionFlags,              // フィルタが使う修正アクション
    pub skip_steps: ProtocolFlags,         // 省略したい手順・応答不要手順
    pub drain_reply: Option<DrainPolicy>,  // Noneならバージョンから自動選択
    pub max_packet_size: usize,            // 受信パケット長上限
    pub client_timeout: Option<Duration>,  // 無通信タイムアウト（Noneなら無制限）
}

impl Default for ClientSettings {
    fn default() -> Self {
        ClientSettings {
            actions: ActionFlags::empty(),
            skip_steps: ProtocolFlags::empty(),
            drain_reply: None,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            client_timeout: None,
        }
    }
}

impl ClientSettings {
    /// 接続ごとの交渉器を生成
    pub fn negotiator(&self) -> Negotiator {
        Negotiator::new(self.actions, self.skip_steps).with_drain_policy(self.drain_reply)
    }
}

/// クライアント1接続ごとの非同期処理（Milterプロトコル）
///
/// 1. パケット受信 → 2. セッション処理（コールバック呼び出し） → 3. 応答送信
///
/// 終了理由（切断・SMFIC_QUIT・エラー・シャットダウン通知）に関わらず
/// フィルタの `disconnect` を1回だけ呼んでから戻る。
pub async fn handle_client<S, H>(
    mut stream: S,                            // クライアントストリーム（TCP/UNIX/テスト用duplex）
    peer_addr: String,                        // 接続元識別用
    handler: H,                               // この接続専用のフィルタ
    settings: ClientSettings,                 // 処理設定
    mut shutdown_rx: broadcast::Receiver<()>, // サーバーからのシャットダウン通知受信
) -> Result<(), MilterError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: Milter,
{
    let mut session = Session::new(handler, settings.negotiator());
    crate::printdaytimeln!("セッション開始: {} id={}", peer_addr, session.session_id());

    let result = serve(&mut session, &mut stream, &settings, &mut shutdown_rx).await;
    match &result {
        Ok(()) => crate::printdaytimeln!("切断: {}", peer_addr),
        Err(MilterError::CloseSession) => crate::printdaytimeln!("切断(フィルタ要求): {}", peer_addr),
        Err(e) => crate::printdaytimeln!("切断(エラー): {} [{:?}] {}", peer_addr, e.kind(), e),
    }

    // エラー終了時もフィルタの後始末は必ず行う
    session.disconnect().await;
    let _ = stream.shutdown().await;
    result
}

// メインループ: 切断・エラー・タイムアウト・シャットダウン通知以外は繰り返しコマンド受信・応答
async fn serve<S, H>(
    session: &mut Session<H>,
    stream: &mut S,
    settings: &ClientSettings,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Result<(), MilterError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: Milter,
{
    loop {
        // --- フェーズ1: パケット受信（シャットダウン通知を同時監視） ---
        let packet = tokio::select! {
            res = read_next(stream, settings) => res?,
            _ = shutdown_rx.recv() => { // サーバー再起動/終了通知（ブロードキャスト）
                crate::printdaytimeln!("シャットダウン通知: id={}", session.session_id());
                return Ok(()); // サーバー都合で切断
            }
        };
        let Some(packet) = packet else {
            return Ok(()); // パケット境界でMTAが切断
        };

        // --- フェーズ2: セッション処理 ---
        let step = session.process(packet).await?;

        // --- フェーズ3: 応答送信（順番通り） ---
        for reply in &step.replies {
            write_packet(stream, reply).await?;
        }
        if step.close {
            return Ok(()); // SMFIC_QUIT
        }
    }
}

// タイムアウト付き1パケット受信
async fn read_next<R>(reader: &mut R, settings: &ClientSettings) -> Result<Option<Packet>, MilterError>
where
    R: AsyncRead + Unpin,
{
    match settings.client_timeout {
        Some(limit) => tokio::time::timeout(limit, read_packet(reader, settings.max_packet_size))
            .await
            .map_err(|_| MilterError::Timeout(limit))?,
        None => read_packet(reader, settings.max_packet_size).await,
    }
}
