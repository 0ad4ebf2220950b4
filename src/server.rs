// =========================
// server.rs
// MilterEngine 接続受付サーバ
//
// 【このファイルで使う主なクレート】
// - tokio: 非同期TCP/UNIXソケット待受・タスク管理・ブロードキャスト（net::TcpListener, net::UnixListener, task::JoinSet, sync::broadcast）
// - crate::client: 接続ごとの処理（handle_client）
// - crate::printdaytimeln!: タイムスタンプ付きログ出力マクロ
//
// 【役割】
// - 待受アドレス（host:port / ポートのみ / unix:パス）の解釈
// - 接続受付ごとにフィルタを1つ生成し、独立したタスクで処理
// - 待受終了通知で待受を終了（再起動時は呼び出し側で再バインド）
// - 接続タスクの追跡と、終了時の全接続の完了待ち（Workers）
// =========================

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use crate::client::{handle_client, ClientSettings};
use crate::error::MilterError;
use crate::handler::Milter;

/// 待受アドレス
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Tcp(String),   // 例: "[::]:8898", "127.0.0.1:10025"
    Unix(PathBuf), // 例: unix:/var/run/milter.sock
}

impl ListenAddr {
    /// 設定値から待受アドレスを解釈
    ///
    /// - "unix:/path" → UNIXドメインソケット
    /// - "host:port" → そのまま
    /// - "8898" → "[::]:8898"（IPv4/IPv6デュアルスタック）
    pub fn parse(value: &str) -> Result<Self, MilterError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(MilterError::NoListenAddr);
        }
        if let Some(path) = value.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(MilterError::NoListenAddr);
            }
            return Ok(ListenAddr::Unix(PathBuf::from(path)));
        }
        if value.contains(':') {
            return Ok(ListenAddr::Tcp(value.to_string()));
        }
        let port: u16 = value
            .parse()
            .map_err(|_| MilterError::Config(format!("Listen のポート番号が不正: {}", value)))?;
        Ok(ListenAddr::Tcp(format!("[::]:{}", port)))
    }
}

impl Default for ListenAddr {
    fn default() -> Self {
        ListenAddr::Tcp("[::]:8898".to_string())
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => f.write_str(addr),
            ListenAddr::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// 終了時に接続の完了を待つ上限
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// 接続タスクの追跡（再バインドをまたいで共有する）
#[derive(Clone, Default)]
pub struct Workers {
    set: Arc<Mutex<JoinSet<()>>>,
}

impl Workers {
    pub fn new() -> Self {
        Workers::default()
    }

    fn spawn<T>(&self, task: T)
    where
        T: Future<Output = ()> + Send + 'static,
    {
        let mut set = match self.set.lock() {
            Ok(set) => set,
            Err(poisoned) => poisoned.into_inner(),
        };
        while set.try_join_next().is_some() {} // 終了済みタスクの回収
        set.spawn(task);
    }

    /// 実行中の接続数
    pub fn active(&self) -> usize {
        let mut set = match self.set.lock() {
            Ok(set) => set,
            Err(poisoned) => poisoned.into_inner(),
        };
        while set.try_join_next().is_some() {}
        set.len()
    }

    /// 全接続の終了を待つ（`limit` を過ぎたら残りを中断し、その数を返す）
    pub async fn wait(&self, limit: Duration) -> usize {
        let mut set = match self.set.lock() {
            Ok(mut set) => std::mem::take(&mut *set),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        let finished = tokio::time::timeout(limit, async {
            while set.join_next().await.is_some() {}
        })
        .await;
        if finished.is_ok() {
            return 0;
        }
        let remaining = set.len();
        set.shutdown().await;
        remaining
    }
}

// バインド済みリスナー
enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

/// Milter接続受付サーバ
///
/// `factory` は接続ごとに呼ばれ、その接続専用のフィルタを返す。
pub struct Server<F> {
    listen: ListenAddr,
    settings: ClientSettings,
    factory: Arc<F>,
    workers: Workers,
}

impl<F, H> Server<F>
where
    F: Fn() -> H + Send + Sync + 'static,
    H: Milter + 'static,
{
    pub fn new(listen: ListenAddr, settings: ClientSettings, factory: F) -> Self {
        Server {
            listen,
            settings,
            factory: Arc::new(factory),
            workers: Workers::new(),
        }
    }

    /// 接続タスクを既存のWorkersで追跡する
    pub fn with_workers(mut self, workers: Workers) -> Self {
        self.workers = workers;
        self
    }

    pub fn workers(&self) -> &Workers {
        &self.workers
    }

    pub fn listen_addr(&self) -> &ListenAddr {
        &self.listen
    }

    async fn bind(&self) -> Result<Listener, MilterError> {
        match &self.listen {
            ListenAddr::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(addr).await?)),
            #[cfg(unix)]
            ListenAddr::Unix(path) => {
                remove_stale_socket(path)?;
                Ok(Listener::Unix(UnixListener::bind(path)?, path.clone()))
            }
            #[cfg(not(unix))]
            ListenAddr::Unix(_) => Err(MilterError::Config(
                "UNIXドメインソケットはこのOSでは使えない".to_string(),
            )),
        }
    }

    /// 待受終了通知を受けるまで接続を受け付ける
    ///
    /// - `stop_rx`: 待受終了通知（設定再読込時の再バインド用）。処理中の接続はそのまま続く
    /// - `shutdown_tx`: 各接続へ配るシャットダウン通知。送られたら待受も終了する
    ///
    /// バインド失敗は `Err`。どちらかの通知を受けたら `Ok` で戻る。
    /// 接続の完了は待たない（`Workers::wait` を使う）。
    pub async fn run(
        &self,
        mut stop_rx: broadcast::Receiver<()>,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> Result<(), MilterError> {
        let listener = self.bind().await?;
        let mut shutdown_rx = shutdown_tx.subscribe(); // 終了時も待受を止める
        crate::printdaytimeln!("待受開始: {}", self.listen);

        loop {
            // クライアント受信ループ
            tokio::select! {
                accepted = accept(&listener) => match accepted {
                    Ok(Accepted::Tcp(stream, peer)) => self.spawn_client(stream, peer, shutdown_tx),
                    #[cfg(unix)]
                    Ok(Accepted::Unix(stream, peer)) => self.spawn_client(stream, peer, shutdown_tx),
                    Err(e) => crate::printdaytimeln!("接続受付エラー: {}", e),
                },
                _ = stop_rx.recv() => {
                    crate::printdaytimeln!("待受終了: {}", self.listen);
                    break;
                }
                _ = shutdown_rx.recv() => {
                    crate::printdaytimeln!("待受終了(シャットダウン): {}", self.listen);
                    break;
                }
            }
        }

        #[cfg(unix)]
        {
            // ソケットファイルの後始末
            if let Listener::Unix(_, path) = &listener {
                let _ = std::fs::remove_file(path);
            }
        }
        Ok(())
    }

    fn spawn_client<S>(&self, stream: S, peer: String, shutdown_tx: &broadcast::Sender<()>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        crate::printdaytimeln!("接続: {}", peer); // 新規接続
        let handler = (self.factory)();
        let settings = self.settings.clone();
        let shutdown_rx = shutdown_tx.subscribe(); // クライアント用レシーバ
        self.workers.spawn(async move {
            // 結果はhandle_client内でログ済み
            let _ = handle_client(stream, peer, handler, settings, shutdown_rx).await;
        });
    }
}

// 前回起動時のソケットファイルが残っていれば削除（ソケット以外のファイルは消さない）
#[cfg(unix)]
fn remove_stale_socket(path: &std::path::Path) -> Result<(), MilterError> {
    use std::os::unix::fs::FileTypeExt;

    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => Ok(std::fs::remove_file(path)?),
        Ok(_) => Err(MilterError::Config(format!(
            "待受パスにソケット以外のファイルがある: {}",
            path.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

enum Accepted {
    Tcp(tokio::net::TcpStream, String),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream, String),
}

async fn accept(listener: &Listener) -> std::io::Result<Accepted> {
    match listener {
        Listener::Tcp(l) => {
            let (stream, addr) = l.accept().await?;
            Ok(Accepted::Tcp(stream, addr.to_string()))
        }
        #[cfg(unix)]
        Listener::Unix(l, path) => {
            let (stream, _) = l.accept().await?;
            Ok(Accepted::Unix(stream, format!("unix:{}", path.display())))
        }
    }
}
