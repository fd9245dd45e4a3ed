use crate::output_writer::OutputWriter;
use crate::recognizer::{pcm_to_wav, Recognizer};
use crate::types::{AudioChunk, LineState, SampleI16, TranscriptRecord, FILE_CHUNK_INDEX};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

/// ワーカーのチャンクキュー容量
///
/// submit はドロップせず、満杯時はバックプレッシャでブロックする。
const QUEUE_CAPACITY: usize = 1024;

/// ライン毎の文字起こしワーカー
///
/// `Idle → Running → Draining → Stopped` の状態遷移を持つ。
/// チャンクをFIFO順にちょうど1回ずつ処理し、結果レコードを
/// OutputWriter に書き込む。認識エラーはログに出して空テキストの
/// レコードとして扱い、ワーカー自体は停止しない。
///
/// 停止要求後もキューに残ったチャンクはすべて処理しきってから
/// Stopped に遷移する（排出完了までフッタは書かれない）。
pub struct TranscriptionWorker {
    line_id: usize,
    tx: mpsc::Sender<AudioChunk>,
    stopping: Arc<AtomicBool>,
    state: Arc<std::sync::Mutex<LineState>>,
    handle: tokio::task::JoinHandle<()>,
}

impl TranscriptionWorker {
    /// ワーカーを起動
    ///
    /// # Arguments
    ///
    /// * `line_id` - ラインID
    /// * `speaker_label` - 出力に付ける話者ラベル
    /// * `recognizer` - 認識バックエンド（全ラインで共有）
    /// * `writer` - 共有出力ライター
    pub fn start(
        line_id: usize,
        speaker_label: Option<String>,
        recognizer: Arc<dyn Recognizer>,
        writer: Arc<OutputWriter>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<AudioChunk>(QUEUE_CAPACITY);
        let stopping = Arc::new(AtomicBool::new(false));
        let state = Arc::new(std::sync::Mutex::new(LineState::Idle));

        let handle = tokio::spawn(run_loop(
            line_id,
            speaker_label,
            rx,
            recognizer,
            writer,
            Arc::clone(&stopping),
            Arc::clone(&state),
        ));

        Self {
            line_id,
            tx,
            stopping,
            state,
            handle,
        }
    }

    /// キャプチャ側に渡すチャンク送信チャネル
    ///
    /// 送信側が全てドロップされると排出完了の合図になる。
    pub fn sender(&self) -> mpsc::Sender<AudioChunk> {
        self.tx.clone()
    }

    /// チャンクを投入
    ///
    /// キューが満杯の場合は空くまで待つ（ドロップしない）。
    pub async fn submit(&self, chunk: AudioChunk) -> anyhow::Result<()> {
        self.tx
            .send(chunk)
            .await
            .map_err(|_| anyhow::anyhow!("ライン {} のワーカーは停止済みです", self.line_id))
    }

    /// 停止を要求
    ///
    /// 以降もキューに残ったチャンクはすべて処理される。
    pub fn signal_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == LineState::Running {
            *state = LineState::Draining;
        }
    }

    /// 現在の状態
    pub fn state(&self) -> LineState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// ラインID
    pub fn line_id(&self) -> usize {
        self.line_id
    }

    /// 自分の送信側を手放し、排出完了を待つ
    ///
    /// キャプチャ側のクローンも既にドロップされていれば、
    /// ワーカーは残りを処理しきって Stopped で終了する。
    pub async fn join(self) -> anyhow::Result<()> {
        drop(self.tx);
        self.handle
            .await
            .map_err(|e| anyhow::anyhow!("ライン {} のワーカーがパニック: {}", self.line_id, e))
    }
}

async fn run_loop(
    line_id: usize,
    speaker_label: Option<String>,
    mut rx: mpsc::Receiver<AudioChunk>,
    recognizer: Arc<dyn Recognizer>,
    writer: Arc<OutputWriter>,
    stopping: Arc<AtomicBool>,
    state: Arc<std::sync::Mutex<LineState>>,
) {
    {
        let mut s = state.lock().unwrap_or_else(|e| e.into_inner());
        *s = LineState::Running;
    }
    log::debug!("ライン {}: ワーカー起動", line_id);

    loop {
        tokio::select! {
            maybe_chunk = rx.recv() => {
                match maybe_chunk {
                    Some(chunk) => {
                        transcribe_chunk(line_id, &speaker_label, chunk, &recognizer, &writer)
                            .await;
                    }
                    None => {
                        // 全送信側がドロップされ、キューも空 = 排出完了
                        break;
                    }
                }
            }
            _ = sleep(Duration::from_secs(1)) => {
                // 停止確認用のタイムアウト。停止中は残量をログに出す
                if stopping.load(Ordering::SeqCst) {
                    log::debug!("ライン {}: 排出中 残り {} チャンク", line_id, rx.len());
                }
            }
        }
    }

    {
        let mut s = state.lock().unwrap_or_else(|e| e.into_inner());
        *s = LineState::Stopped;
    }
    log::info!("ライン {}: ワーカー停止", line_id);
    writer.line_finished(line_id);
}

/// 1チャンクを文字起こしして書き込み
///
/// 認識エラーはここで吸収する。ログに出し、空テキストの
/// レコードとして扱う（OutputWriter は空レコードを書かない）。
async fn transcribe_chunk(
    line_id: usize,
    speaker_label: &Option<String>,
    chunk: AudioChunk,
    recognizer: &Arc<dyn Recognizer>,
    writer: &Arc<OutputWriter>,
) {
    let sequence_index = chunk.sequence_index;
    let text = match pcm_to_wav(&chunk.samples, chunk.format.sample_rate) {
        Ok(wav_data) => match recognizer.transcribe(wav_data).await {
            Ok(text) => text,
            Err(e) => {
                log::error!(
                    "ライン {} チャンク {}: 認識失敗: {}",
                    line_id,
                    sequence_index,
                    e
                );
                String::new()
            }
        },
        Err(e) => {
            log::error!(
                "ライン {} チャンク {}: WAV変換失敗: {}",
                line_id,
                sequence_index,
                e
            );
            String::new()
        }
    };

    writer.write(&TranscriptRecord {
        line_id,
        sequence_index,
        speaker_label: speaker_label.clone(),
        text,
    });
}

/// ファイル全体の一括文字起こし
///
/// ファイル入力モード用。ファイル全体を1チャンクとして1回だけ
/// 認識し、結果を文単位に分割してから書き込む。
pub async fn transcribe_file_sync(
    line_id: usize,
    speaker_label: Option<String>,
    samples: &[SampleI16],
    sample_rate: u32,
    recognizer: Arc<dyn Recognizer>,
    writer: Arc<OutputWriter>,
) -> anyhow::Result<()> {
    let wav_data = pcm_to_wav(samples, sample_rate)?;
    log::info!(
        "ライン {}: ファイル一括文字起こし ({:.1}秒)",
        line_id,
        samples.len() as f64 / sample_rate as f64
    );

    let text = match recognizer.transcribe(wav_data).await {
        Ok(text) => text,
        Err(e) => {
            log::error!("ライン {}: ファイル文字起こし失敗: {}", line_id, e);
            String::new()
        }
    };

    for sentence in reflow_sentences(&text) {
        writer.write(&TranscriptRecord {
            line_id,
            sequence_index: FILE_CHUNK_INDEX,
            speaker_label: speaker_label.clone(),
            text: sentence,
        });
    }

    writer.line_finished(line_id);
    Ok(())
}

/// テキストを文単位に分割
///
/// `.` `!` `?` の直後に空白が続く位置を文境界とみなす。
/// 句読点は文側に残し、前後の空白は取り除く。
/// 境界のない残りは最後の要素として返す。
pub fn reflow_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') && chars.peek().map_or(true, |n| n.is_whitespace()) {
            let sentence = current.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            current.clear();
        }
    }

    let rest = current.trim();
    if !rest.is_empty() {
        sentences.push(rest.to_string());
    }

    sentences
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AudioFormat;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::fs;
    use std::io::Cursor;
    use std::sync::atomic::AtomicU64;
    use tempfile::TempDir;

    /// WAVペイロードの先頭サンプル値 k から "hello-{k}" を合成する
    /// モック認識バックエンド
    struct IndexRecognizer;

    #[async_trait]
    impl Recognizer for IndexRecognizer {
        async fn transcribe(&self, wav_data: Vec<u8>) -> Result<String> {
            let mut reader = hound::WavReader::new(Cursor::new(&wav_data))?;
            let first: i16 = reader.samples::<i16>().next().transpose()?.unwrap_or(0);
            Ok(format!("hello-{}", first))
        }

        fn name(&self) -> &'static str {
            "index-mock"
        }
    }

    /// N回目の呼び出しだけ失敗するモック
    struct FlakyRecognizer {
        calls: AtomicU64,
        fail_on: u64,
    }

    #[async_trait]
    impl Recognizer for FlakyRecognizer {
        async fn transcribe(&self, _wav_data: Vec<u8>) -> Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == self.fail_on {
                anyhow::bail!("モック認識エラー");
            }
            Ok(format!("ok-{}", call))
        }

        fn name(&self) -> &'static str {
            "flaky-mock"
        }
    }

    fn chunk(line_id: usize, index: u64, marker: i16) -> AudioChunk {
        AudioChunk {
            line_id,
            sequence_index: index,
            samples: vec![marker; 160],
            format: AudioFormat {
                sample_rate: 16000,
                channels: 1,
            },
        }
    }

    fn setup(dir: &TempDir, lines: &[usize]) -> Arc<OutputWriter> {
        let writer = Arc::new(OutputWriter::new(dir.path()));
        writer.start_session().unwrap();
        for &line_id in lines {
            writer.register_line(line_id);
        }
        writer
    }

    fn session_content(dir: &TempDir) -> String {
        fs::read_to_string(dir.path().join("transcription-1.txt")).unwrap()
    }

    #[tokio::test]
    async fn test_two_lines_interleaved_chunks() {
        // 2ライン×3チャンク。出力は6行、ライン毎に連番順
        let dir = TempDir::new().unwrap();
        let writer = setup(&dir, &[0, 1]);
        let recognizer: Arc<dyn Recognizer> = Arc::new(IndexRecognizer);

        let worker_a = TranscriptionWorker::start(
            0,
            Some("A".to_string()),
            Arc::clone(&recognizer),
            Arc::clone(&writer),
        );
        let worker_b = TranscriptionWorker::start(
            1,
            Some("B".to_string()),
            Arc::clone(&recognizer),
            Arc::clone(&writer),
        );

        for i in 0..3u64 {
            worker_a.submit(chunk(0, i, i as i16)).await.unwrap();
            worker_b.submit(chunk(1, i, (100 + i) as i16)).await.unwrap();
        }

        worker_a.join().await.unwrap();
        worker_b.join().await.unwrap();

        let content = session_content(&dir);
        let a_lines: Vec<&str> = content.lines().filter(|l| l.starts_with("A: ")).collect();
        let b_lines: Vec<&str> = content.lines().filter(|l| l.starts_with("B: ")).collect();
        assert_eq!(a_lines, vec!["A: hello-0", "A: hello-1", "A: hello-2"]);
        assert_eq!(b_lines, vec!["B: hello-100", "B: hello-101", "B: hello-102"]);
        assert!(content.contains("Transcription ended at"));
    }

    #[tokio::test]
    async fn test_recognizer_error_does_not_stop_worker() {
        // 2チャンク目で認識が失敗してもワーカーは動き続け、
        // 失敗チャンクのレコードは書かれない
        let dir = TempDir::new().unwrap();
        let writer = setup(&dir, &[0]);
        let recognizer: Arc<dyn Recognizer> = Arc::new(FlakyRecognizer {
            calls: AtomicU64::new(0),
            fail_on: 1,
        });

        let worker = TranscriptionWorker::start(
            0,
            Some("A".to_string()),
            recognizer,
            Arc::clone(&writer),
        );

        worker.submit(chunk(0, 0, 0)).await.unwrap();
        worker.submit(chunk(0, 1, 0)).await.unwrap();

        // 処理が進むのを待ってから状態を確認
        sleep(Duration::from_millis(200)).await;
        assert_eq!(worker.state(), LineState::Running);

        worker.submit(chunk(0, 2, 0)).await.unwrap();
        worker.join().await.unwrap();

        let content = session_content(&dir);
        let records: Vec<&str> = content.lines().filter(|l| l.starts_with("A: ")).collect();
        // 呼び出し1 (2チャンク目) は失敗して空レコード扱い
        assert_eq!(records, vec!["A: ok-0", "A: ok-2"]);
    }

    #[tokio::test]
    async fn test_stop_drains_all_queued_chunks() {
        // 5チャンク投入直後に停止しても、5件すべてがフッタの前に書かれる
        let dir = TempDir::new().unwrap();
        let writer = setup(&dir, &[0]);
        let recognizer: Arc<dyn Recognizer> = Arc::new(IndexRecognizer);

        let worker = TranscriptionWorker::start(
            0,
            Some("A".to_string()),
            recognizer,
            Arc::clone(&writer),
        );

        for i in 0..5u64 {
            worker.submit(chunk(0, i, i as i16)).await.unwrap();
        }
        worker.signal_stop();
        worker.join().await.unwrap();

        let content = session_content(&dir);
        let footer_pos = content.find("Transcription ended").unwrap();
        for i in 0..5 {
            let pos = content
                .find(&format!("A: hello-{}", i))
                .unwrap_or_else(|| panic!("チャンク {} が書かれていない", i));
            assert!(pos < footer_pos);
        }
    }

    #[tokio::test]
    async fn test_records_in_sequence_order() {
        let dir = TempDir::new().unwrap();
        let writer = setup(&dir, &[0]);
        let recognizer: Arc<dyn Recognizer> = Arc::new(IndexRecognizer);

        let worker = TranscriptionWorker::start(0, None, recognizer, Arc::clone(&writer));
        for i in 0..10u64 {
            worker.submit(chunk(0, i, i as i16)).await.unwrap();
        }
        worker.join().await.unwrap();

        let content = session_content(&dir);
        let indices: Vec<u64> = content
            .lines()
            .filter_map(|l| l.strip_prefix("hello-"))
            .map(|n| n.parse().unwrap())
            .collect();
        let expected: Vec<u64> = (0..10).collect();
        assert_eq!(indices, expected);
    }

    #[tokio::test]
    async fn test_transcribe_file_reflows_sentences() {
        struct ProseRecognizer;

        #[async_trait]
        impl Recognizer for ProseRecognizer {
            async fn transcribe(&self, _wav_data: Vec<u8>) -> Result<String> {
                Ok("First sentence. Second one! Third? trailing words".to_string())
            }

            fn name(&self) -> &'static str {
                "prose-mock"
            }
        }

        let dir = TempDir::new().unwrap();
        let writer = setup(&dir, &[0]);

        transcribe_file_sync(
            0,
            Some("F".to_string()),
            &vec![0i16; 16000],
            16000,
            Arc::new(ProseRecognizer),
            Arc::clone(&writer),
        )
        .await
        .unwrap();

        let content = session_content(&dir);
        let records: Vec<&str> = content.lines().filter(|l| l.starts_with("F: ")).collect();
        assert_eq!(
            records,
            vec![
                "F: First sentence.",
                "F: Second one!",
                "F: Third?",
                "F: trailing words"
            ]
        );
        assert!(content.contains("Transcription ended at"));
    }

    #[test]
    fn test_reflow_basic() {
        assert_eq!(
            reflow_sentences("Hello. World!"),
            vec!["Hello.", "World!"]
        );
    }

    #[test]
    fn test_reflow_does_not_split_decimals() {
        // 空白が続かない句点は文境界ではない
        assert_eq!(
            reflow_sentences("Pi is 3.14 roughly. Yes"),
            vec!["Pi is 3.14 roughly.", "Yes"]
        );
    }

    #[test]
    fn test_reflow_empty_and_whitespace() {
        assert!(reflow_sentences("").is_empty());
        assert!(reflow_sentences("   ").is_empty());
    }

    #[test]
    fn test_reflow_no_boundary() {
        assert_eq!(reflow_sentences("no punctuation here"), vec!["no punctuation here"]);
    }
}
