// =========================
// main.rs
// MilterEngine メインプログラム（Milterフィルタサーバ）
//
// 【このファイルで使う主なクレート】
// - tokio: 非同期ランタイム・シグナル・ブロードキャスト（signal::unix, sync::broadcast）
// - std: スレッド安全な参照カウント・ロック（Arc, RwLock）
// - milter_engine::init: 設定ファイル管理
// - milter_engine::server: 接続受付サーバ
// - milter_engine::parse: 同梱フィルタ（DecoderMilter）
// - milter_engine::printdaytimeln!: タイムスタンプ付きログ出力
//
// 【役割】
// - サーバー起動・設定管理・シグナル処理（SIGHUP: 再読込+再バインド, SIGTERM: 終了）
// - 終了時は全接続へ通知し、disconnect完了まで待ってから終了
// =========================

use std::sync::{Arc, RwLock}; // スレッド安全な参照カウント・ロック

use milter_engine::init::{load_config, Config, DEFAULT_CONFIG_PATH};
use milter_engine::parse::DecoderMilter;
use milter_engine::printdaytimeln;
use milter_engine::server::{Server, Workers, SHUTDOWN_GRACE};
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind}; // Unix系: シグナル受信
#[cfg(windows)]
use tokio::signal::windows::{ctrl_break, ctrl_c}; // Windows: Ctrl+C/Break受信
use tokio::sync::broadcast; // 再バインド・終了通知

// 設定ファイルを読み直して共有設定を更新（失敗時は旧設定のまま）
fn reload(config: &RwLock<Config>, path: &str) -> bool {
    match load_config(path) {
        Ok(new_config) => {
            new_config.apply_logging();
            if let Ok(mut guard) = config.write() {
                *guard = new_config; // 設定更新
            }
            true
        }
        Err(e) => {
            printdaytimeln!("設定再読込失敗（旧設定で継続）: {}", e);
            false
        }
    }
}

/// 非同期メイン関数（Tokioランタイム）
#[tokio::main]
async fn main() {
    // 設定ファイルパス（第1引数、省略時はMilterEngine.conf）
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("設定読込失敗: {}", e);
            std::process::exit(1);
        }
    };
    config.apply_logging();
    // 設定をスレッド安全に共有（Arc+RwLock）
    let config = Arc::new(RwLock::new(config));
    // 再バインド通知（待受のみ）と終了通知（全クライアント）
    let (rebind_tx, _) = broadcast::channel::<()>(16);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    #[cfg(unix)]
    {
        let config = Arc::clone(&config);
        let config_path = config_path.clone();
        let rebind_tx = rebind_tx.clone();
        let shutdown_tx = shutdown_tx.clone();
        // SIGHUP受信: 設定ファイル再読込
        tokio::spawn(async move {
            let mut hup = match signal(SignalKind::hangup()) {
                Ok(hup) => hup,
                Err(e) => {
                    printdaytimeln!("SIGHUP登録失敗: {}", e);
                    return;
                }
            };
            while hup.recv().await.is_some() {
                printdaytimeln!("SIGHUP受信: 設定ファイル再読込");
                if reload(&config, &config_path) {
                    let _ = rebind_tx.send(()); // 待受を再バインド（処理中の接続は継続）
                }
            }
        });
        // SIGTERM受信: サーバー安全終了
        tokio::spawn(async move {
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    printdaytimeln!("SIGTERM登録失敗: {}", e);
                    return;
                }
            };
            if term.recv().await.is_some() {
                printdaytimeln!("SIGTERM受信: サーバー安全終了");
                let _ = shutdown_tx.send(()); // 待受停止・全クライアントへ終了通知
            }
        });
    }

    #[cfg(windows)]
    {
        let config = Arc::clone(&config);
        let config_path = config_path.clone();
        let rebind_tx = rebind_tx.clone();
        let shutdown_tx = shutdown_tx.clone();
        // Ctrl+C受信: 設定ファイル再読込（SIGHUP相当）
        tokio::spawn(async move {
            let mut ctrl_c_signal = match ctrl_c() {
                Ok(s) => s,
                Err(e) => {
                    printdaytimeln!("Ctrl+C登録失敗: {}", e);
                    return;
                }
            };
            while ctrl_c_signal.recv().await.is_some() {
                printdaytimeln!("Ctrl+C受信: 設定ファイル再読込");
                if reload(&config, &config_path) {
                    let _ = rebind_tx.send(());
                }
            }
        });
        // Ctrl+Break受信: サーバー安全終了（SIGTERM相当）
        tokio::spawn(async move {
            let mut ctrl_break_signal = match ctrl_break() {
                Ok(s) => s,
                Err(e) => {
                    printdaytimeln!("Ctrl+Break登録失敗: {}", e);
                    return;
                }
            };
            if ctrl_break_signal.recv().await.is_some() {
                printdaytimeln!("Ctrl+Break受信: サーバー安全終了");
                let _ = shutdown_tx.send(());
            }
        });
    }

    let workers = Workers::new();
    let mut term_rx = shutdown_tx.subscribe(); // 終了通知はメインループでも受ける

    loop {
        // サーバー再起動ループ
        let current = match config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        printdaytimeln!(
            "設定読込: listen={} actions={:?} skip={:?}",
            current.listen,
            current.actions.names(),
            current.skip_steps.names()
        );
        let server = Server::new(current.listen.clone(), current.client_settings(), DecoderMilter::new)
            .with_workers(workers.clone());
        tokio::select! {
            biased;
            result = server.run(rebind_tx.subscribe(), &shutdown_tx) => {
                if let Err(e) = result {
                    eprintln!("待受失敗: {}\n他プロセスが {} 使用中?", e, current.listen);
                    std::process::exit(1); // 異常終了
                }
                if term_rx.try_recv().is_ok() {
                    break; // 終了通知で待受が止まった
                }
                printdaytimeln!("再起動のためリスナー再バインド");
            }
            _ = term_rx.recv() => break,
        }
    }

    // 各接続のdisconnectが終わるまで待つ
    printdaytimeln!("終了待ち: 接続数={}", workers.active());
    let aborted = workers.wait(SHUTDOWN_GRACE).await;
    if aborted > 0 {
        printdaytimeln!("終了待ちタイムアウト: {}接続を中断", aborted);
    }
    printdaytimeln!("サーバー終了");
}
