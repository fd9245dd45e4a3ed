use crate::audio_source::{AudioSource, FileSource, SourceRead};
use crate::chunker::ChunkAccumulator;
use crate::output_writer::OutputWriter;
use crate::recognizer::Recognizer;
use crate::recorder::Recorder;
use crate::types::{convert_samples, PipelineState};
use crate::worker::{transcribe_file_sync, TranscriptionWorker};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// 1ライン分の実行時構成
///
/// 設定から組み立てられ、start に渡される。実行中は不変。
pub struct LineRuntime {
    pub line_id: usize,
    pub speaker_label: String,
    pub record: bool,
    pub transcribe: bool,
    pub source: Box<dyn AudioSource>,
}

impl LineRuntime {
    pub fn is_runnable(&self) -> bool {
        self.record || self.transcribe
    }
}

struct RunningLine {
    line_id: usize,
    stop: Arc<AtomicBool>,
    capture: tokio::task::JoinHandle<Result<()>>,
    worker: Option<TranscriptionWorker>,
}

/// パイプライン全体の調整役
///
/// N本の (AudioSource → ChunkAccumulator → TranscriptionWorker
/// [+ Recorder]) パイプラインを並列に駆動し、1つの OutputWriter
/// セッションを共有させる。
///
/// 停止手順: まず全ラインのキャプチャを止め、最終の部分チャンクを
/// 投入させてからワーカーの排出完了を待つ。排出にタイムアウトは
/// 設けない（シャットダウンの速さより取りこぼしのなさを優先）。
pub struct PipelineCoordinator {
    writer: Arc<OutputWriter>,
    recognizer: Arc<dyn Recognizer>,
    chunk_duration_seconds: f64,
    sample_rate: u32,
    state: Arc<std::sync::Mutex<PipelineState>>,
    lines: Vec<RunningLine>,
}

impl PipelineCoordinator {
    pub fn new(
        writer: Arc<OutputWriter>,
        recognizer: Arc<dyn Recognizer>,
        chunk_duration_seconds: f64,
        sample_rate: u32,
    ) -> Self {
        Self {
            writer,
            recognizer,
            chunk_duration_seconds,
            sample_rate,
            state: Arc::new(std::sync::Mutex::new(PipelineState::Idle)),
            lines: Vec::new(),
        }
    }

    /// 現在のパイプライン状態
    pub fn state(&self) -> PipelineState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// パイプラインを起動
    ///
    /// 起動対象（録音か文字起こしが有効）のラインが1つもない場合は
    /// 副作用なしで失敗する。個々のラインのオープン失敗は隔離され、
    /// 残りのラインで続行する。全ラインが失敗した場合のみ起動自体が
    /// 失敗し、セッションは作られない。
    ///
    /// 成功時はセッション番号を返す。
    pub async fn start(&mut self, lines: Vec<LineRuntime>) -> Result<u32> {
        {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != PipelineState::Idle {
                anyhow::bail!("パイプラインは既に起動されています: {:?}", *state);
            }
        }

        let runnable: Vec<LineRuntime> = lines.into_iter().filter(|l| l.is_runnable()).collect();
        if runnable.is_empty() {
            anyhow::bail!("録音か文字起こしが有効なラインがありません");
        }

        // セッション作成前に全ラインのオープンを試みる。デバイスの
        // オープンは数秒ブロックしうるためワーカースレッドで行う。
        // 失敗したラインはログに出して除外する
        let opened = tokio::task::spawn_blocking(move || {
            let mut opened = Vec::new();
            for mut line in runnable {
                match line.source.open() {
                    Ok(()) => opened.push(line),
                    Err(e) => {
                        log::error!(
                            "ライン {} ({}): オープンに失敗したため除外します: {}",
                            line.line_id,
                            line.speaker_label,
                            e
                        );
                    }
                }
            }
            opened
        })
        .await
        .context("ラインのオープン処理に失敗")?;

        if opened.is_empty() {
            anyhow::bail!("全ラインのオープンに失敗しました");
        }

        let session_index = self.writer.start_session()?;

        // 録音の準備。録音専用ラインで録音が開始できない場合、
        // そのラインは何も生み出せないため即座に停止する
        let mut ready = Vec::new();
        for mut line in opened {
            let recorder = if line.record {
                match self.start_recorder(line.line_id, &line.speaker_label, session_index) {
                    Ok(recorder) => Some(recorder),
                    Err(e) => {
                        log::error!("ライン {}: 録音を開始できません: {}", line.line_id, e);
                        None
                    }
                }
            } else {
                None
            };

            if !line.transcribe && recorder.is_none() {
                log::error!(
                    "ライン {} ({}): 録音専用ラインのため停止します",
                    line.line_id,
                    line.speaker_label
                );
                let _ = line.source.close();
                continue;
            }

            ready.push((line, recorder));
        }

        if ready.is_empty() {
            anyhow::bail!("起動できるラインがありません");
        }

        // 起動するラインを登録する。文字起こし無効のラインも
        // キャプチャ終了時に完了を通知し、セッションを閉じる側に数える
        for (line, _) in &ready {
            self.writer.register_line(line.line_id);
        }

        for (line, recorder) in ready {
            let LineRuntime {
                line_id,
                speaker_label,
                record: _,
                transcribe,
                source,
            } = line;

            let worker = if transcribe {
                Some(TranscriptionWorker::start(
                    line_id,
                    Some(speaker_label.clone()),
                    Arc::clone(&self.recognizer),
                    Arc::clone(&self.writer),
                ))
            } else {
                None
            };

            let tx = worker.as_ref().map(|w| w.sender());
            let stop = Arc::new(AtomicBool::new(false));
            let accumulator =
                ChunkAccumulator::new(line_id, self.chunk_duration_seconds, self.sample_rate);

            let capture = tokio::task::spawn_blocking({
                let stop = Arc::clone(&stop);
                let writer = Arc::clone(&self.writer);
                move || {
                    capture_loop(line_id, source, recorder, accumulator, tx, stop, writer)
                }
            });

            log::info!("ライン {} ({}) を起動しました", line_id, speaker_label);
            self.lines.push(RunningLine {
                line_id,
                stop,
                capture,
                worker,
            });
        }

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            *state = PipelineState::Running;
        }

        Ok(session_index)
    }

    fn start_recorder(
        &self,
        line_id: usize,
        speaker_label: &str,
        session_index: u32,
    ) -> Result<Recorder> {
        let mut recorder = Recorder::new(
            line_id,
            speaker_label,
            self.writer_output_dir(),
            self.sample_rate,
        )?;
        recorder.start(session_index)?;
        Ok(recorder)
    }

    fn writer_output_dir(&self) -> std::path::PathBuf {
        self.writer.output_dir().to_path_buf()
    }

    /// パイプラインを停止
    ///
    /// 1. 全ラインのキャプチャ停止フラグを立てる
    /// 2. キャプチャループの終了を待つ（最終部分チャンク投入と
    ///    チャネルクローズを含む）
    /// 3. 各ワーカーの排出完了を待つ
    ///
    /// 途中でエラーがあっても全ラインの停止は続行し、最初の
    /// エラーを返す。
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != PipelineState::Running {
                return Ok(());
            }
            *state = PipelineState::Stopping;
        }
        log::info!("パイプラインを停止しています");

        // キャプチャを先に全て止める
        for line in &self.lines {
            line.stop.store(true, Ordering::SeqCst);
        }

        let mut first_error: Option<anyhow::Error> = None;

        for line in std::mem::take(&mut self.lines) {
            match line.capture.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::error!("ライン {}: キャプチャエラー: {}", line.line_id, e);
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    log::error!("ライン {}: キャプチャタスクがパニック: {}", line.line_id, e);
                    first_error.get_or_insert_with(|| anyhow::anyhow!(e));
                }
            }

            if let Some(worker) = line.worker {
                worker.signal_stop();
                if let Err(e) = worker.join().await {
                    log::error!("ライン {}: ワーカーエラー: {}", line.line_id, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            *state = PipelineState::Stopped;
        }
        log::info!("パイプラインを停止しました");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// WAVファイルの一括文字起こし
    ///
    /// ファイル全体をデコードして1回の認識にかけ、文単位で
    /// 書き出してセッションを閉じる。
    pub async fn transcribe_file<P: AsRef<Path>>(
        path: P,
        speaker_label: Option<String>,
        recognizer: Arc<dyn Recognizer>,
        writer: Arc<OutputWriter>,
    ) -> Result<()> {
        let mut source = FileSource::new(path.as_ref());
        source.open()?;
        let sample_rate = source.sample_rate();

        let mut samples = Vec::new();
        loop {
            match source.read_next()? {
                SourceRead::Samples(block) => samples.extend(convert_samples(&block)),
                SourceRead::EndOfStream => break,
            }
        }
        source.close()?;

        if samples.is_empty() {
            anyhow::bail!("WAVファイルにサンプルがありません: {:?}", path.as_ref());
        }

        writer.start_session()?;
        writer.register_line(0);

        transcribe_file_sync(0, speaker_label, &samples, sample_rate, recognizer, writer).await
    }
}

/// ライン毎のキャプチャループ (ブロッキング)
///
/// ソースから読み、録音し、チャンクに組み立ててワーカーへ送る。
/// 停止フラグかストリーム終端で抜け、最終の部分チャンクを投入して
/// から送信側を手放す（これがワーカーの排出完了の合図になる）。
fn capture_loop(
    line_id: usize,
    mut source: Box<dyn AudioSource>,
    mut recorder: Option<Recorder>,
    mut accumulator: ChunkAccumulator,
    tx: Option<mpsc::Sender<crate::types::AudioChunk>>,
    stop: Arc<AtomicBool>,
    writer: Arc<OutputWriter>,
) -> Result<()> {
    let has_worker = tx.is_some();
    let mut capture_result: Result<()> = Ok(());

    while !stop.load(Ordering::SeqCst) {
        match source.read_next() {
            Ok(SourceRead::Samples(block)) => {
                if block.is_empty() {
                    // データ待ちタイムアウト。停止フラグを確認しに戻る
                    continue;
                }

                let samples = convert_samples(&block);

                if let Some(rec) = recorder.as_mut() {
                    if let Err(e) = rec.write_samples(&samples) {
                        log::error!("ライン {}: 録音に失敗したため無効化します: {}", line_id, e);
                        recorder = None;
                    }
                }

                let mut worker_gone = false;
                for chunk in accumulator.push(&samples) {
                    if let Some(tx) = &tx {
                        if tx.blocking_send(chunk).is_err() {
                            log::error!("ライン {}: ワーカーが停止済みです", line_id);
                            worker_gone = true;
                            break;
                        }
                    }
                }
                if worker_gone {
                    break;
                }
            }
            Ok(SourceRead::EndOfStream) => {
                log::info!("ライン {}: ストリーム終端", line_id);
                break;
            }
            Err(e) => {
                log::error!("ライン {}: 読み込みエラー: {}", line_id, e);
                capture_result = Err(e).context(format!("ライン {} のキャプチャに失敗", line_id));
                break;
            }
        }
    }

    // 端数サンプルを最終の部分チャンクとして投入
    if let Some(tx) = &tx {
        if let Some(last) = accumulator.finish() {
            log::debug!(
                "ライン {}: 最終部分チャンク ({:.2}秒)",
                line_id,
                last.duration_seconds()
            );
            let _ = tx.blocking_send(last);
        }
    }

    if let Err(e) = source.close() {
        log::error!("ライン {}: クローズに失敗: {}", line_id, e);
        if capture_result.is_ok() {
            capture_result = Err(e);
        }
    }

    if let Some(rec) = recorder.as_mut() {
        if let Err(e) = rec.finalize() {
            log::error!("ライン {}: 録音のファイナライズに失敗: {}", line_id, e);
        }
    }

    // 文字起こし無効のラインはここで完了を通知する。
    // 有効なラインはワーカーが排出完了時に通知する
    if !has_worker {
        writer.line_finished(line_id);
    }

    capture_result
}
