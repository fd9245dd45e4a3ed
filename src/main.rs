use anyhow::Result;
use env_logger::Env;
use line_transcribe::audio_source::{list_devices, DeviceSource};
use line_transcribe::config::Config;
use line_transcribe::coordinator::{LineRuntime, PipelineCoordinator};
use line_transcribe::output_writer::OutputWriter;
use line_transcribe::recognizer::create_recognizer;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

#[tokio::main]
async fn main() -> Result<()> {
    // ロガーを初期化
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    // コマンドライン引数をパース
    let args: Vec<String> = std::env::args().collect();

    // デバイス一覧表示モード
    if args.len() > 1 && args[1] == "--show-interfaces" {
        list_devices()?;
        return Ok(());
    }

    // 設定ファイル生成モード
    if args.len() > 1 && args[1] == "--generate-config" {
        let config_path = if args.len() > 2 {
            &args[2]
        } else {
            "config.toml"
        };
        Config::write_default(config_path)?;
        println!("設定ファイルを生成しました: {}", config_path);
        return Ok(());
    }

    // ファイル一括文字起こしモード
    if args.len() > 1 && args[1] == "--file" {
        let Some(wav_path) = args.get(2) else {
            anyhow::bail!("--file にはWAVファイルのパスを指定してください");
        };
        let config_path = args.get(3).map(String::as_str).unwrap_or("config.toml");
        let config = Config::load_or_default(config_path)?;
        config.validate()?;

        let writer = Arc::new(OutputWriter::new(&config.output.output_directory));
        let recognizer = create_recognizer(&config)?;
        let speaker_label = config.lines.first().map(|l| l.speaker_label.clone());

        PipelineCoordinator::transcribe_file(wav_path, speaker_label, recognizer, writer).await?;
        println!("文字起こしが完了しました: {}", wav_path);
        return Ok(());
    }

    // 設定ファイルのパス
    let config_path = if args.len() > 1 && !args[1].starts_with("--") {
        &args[1]
    } else {
        "config.toml"
    };

    // 設定を読み込み
    let config = Config::load_or_default(config_path)?;
    config.validate()?;

    log::info!("line-transcribe を起動します");
    log::info!("設定: {:?}", config);

    // Ctrl+C ハンドラを設定
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    ctrlc::set_handler(move || {
        log::info!("停止シグナルを受信しました...");
        running_clone.store(false, Ordering::SeqCst);
    })?;

    // 出力と認識バックエンドを準備
    let writer = Arc::new(OutputWriter::new(&config.output.output_directory));
    writer.set_completion_callback(Box::new(|| {
        log::info!("セッションファイルを閉じました");
    }));
    let recognizer = create_recognizer(&config)?;

    // 設定から各ラインを組み立て
    let mut lines = Vec::new();
    for (line_id, line_config) in config.lines.iter().enumerate() {
        if !line_config.is_runnable() {
            log::info!(
                "ライン {} ({}) は録音も文字起こしも無効です",
                line_id,
                line_config.speaker_label
            );
            continue;
        }

        let source = DeviceSource::new(
            &line_config.device,
            config.audio.sample_rate,
            config.capture.queue_capacity,
            config.capture.drop_policy,
        );

        lines.push(LineRuntime {
            line_id,
            speaker_label: line_config.speaker_label.clone(),
            record: line_config.record,
            transcribe: line_config.transcribe,
            source: Box::new(source),
        });
    }

    let mut coordinator = PipelineCoordinator::new(
        Arc::clone(&writer),
        recognizer,
        config.audio.chunk_duration_seconds,
        config.audio.sample_rate,
    );

    let session = coordinator.start(lines).await?;
    log::info!("セッション {} を開始しました (Ctrl+C で停止)", session);

    // メインループ: 停止を待つ
    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }

    // クリーンアップ: キャプチャ停止 → キュー排出 → セッションクローズ
    log::info!("停止処理を開始します...");
    coordinator.stop().await?;

    log::info!("line-transcribe を終了しました");

    Ok(())
}
