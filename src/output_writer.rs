use crate::types::TranscriptRecord;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// 完了通知コールバック
pub type CompletionCallback = Box<dyn Fn() + Send + Sync>;

/// 共有出力ライター
///
/// 全ラインの文字起こし結果を1つのセッションファイル
/// (`transcription-{N}.txt`) に書き出す。`write` と `line_finished` は
/// 単一のMutexで直列化され、レコード単位でのみ交錯する。
///
/// セッション番号は出力ディレクトリをスキャンして既存の最大番号+1を
/// 割り当てる（最初は1）。既存ファイルの番号を再利用することはない。
pub struct OutputWriter {
    output_dir: PathBuf,
    inner: Mutex<Inner>,
    on_complete: Mutex<Option<CompletionCallback>>,
}

struct Inner {
    file: Option<File>,
    session_index: u32,
    registered: HashSet<usize>,
    finished: HashSet<usize>,
}

impl OutputWriter {
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            inner: Mutex::new(Inner {
                file: None,
                session_index: 0,
                registered: HashSet::new(),
                finished: HashSet::new(),
            }),
            on_complete: Mutex::new(None),
        }
    }

    /// セッション完了時に呼ばれるコールバックを設定
    ///
    /// 全ラインの `line_finished` が揃いフッタを書き終えた後、
    /// ロックの外で呼び出される。
    pub fn set_completion_callback(&self, callback: CompletionCallback) {
        let mut slot = self.on_complete.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(callback);
    }

    /// 新しいセッションを開始
    ///
    /// 出力ディレクトリを作成し、`transcription-{N}.txt` を割り当てて
    /// 開始タイムスタンプのヘッダを書き込む。N は既存の最大番号+1
    /// （既存ファイルがなければ1）。
    ///
    /// # Errors
    ///
    /// ディレクトリ作成またはファイル作成に失敗した場合。
    pub fn start_session(&self) -> Result<u32> {
        fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("出力ディレクトリの作成に失敗: {:?}", self.output_dir))?;

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        // 既存セッションが開いたままなら先に閉じる
        if inner.file.is_some() {
            log::warn!("前のセッションが閉じられていません。強制的に閉じます");
            Self::write_footer(&mut inner);
        }

        let next = next_session_index(&self.output_dir)?;
        let path = self.output_dir.join(format!("transcription-{}.txt", next));
        let mut file = File::create(&path)
            .with_context(|| format!("文字起こしファイルの作成に失敗: {:?}", path))?;

        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        writeln!(file, "Transcription started at {}", timestamp)
            .context("ヘッダの書き込みに失敗")?;
        writeln!(file).context("ヘッダの書き込みに失敗")?;
        file.flush().context("ヘッダのフラッシュに失敗")?;

        log::info!("セッション開始: {:?}", path);

        inner.file = Some(file);
        inner.session_index = next;
        inner.registered.clear();
        inner.finished.clear();

        Ok(next)
    }

    /// ラインをこのセッションに登録
    ///
    /// 登録された全ラインの `line_finished` が揃うとセッションが閉じる。
    pub fn register_line(&self, line_id: usize) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.registered.insert(line_id);
    }

    /// 文字起こしレコードを書き込み
    ///
    /// 空テキストのレコードは「音声なし」として黙ってスキップする。
    /// 書き込み後にフラッシュとfsyncを行う（スループットより耐久性）。
    /// I/Oエラーはログに出すだけでパイプラインには伝播しない。
    pub fn write(&self, record: &TranscriptRecord) {
        if record.is_blank() {
            return;
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(file) = inner.file.as_mut() else {
            log::warn!(
                "セッション未開始のためレコードを破棄: line={} index={}",
                record.line_id,
                record.sequence_index
            );
            return;
        };

        let line = match &record.speaker_label {
            Some(label) => format!("{}: {}\n", label, record.text),
            None => format!("{}\n", record.text),
        };

        let result = file
            .write_all(line.as_bytes())
            .and_then(|_| file.flush())
            .and_then(|_| file.sync_data());
        if let Err(e) = result {
            log::error!(
                "文字起こしの書き込みに失敗: line={} index={}: {}",
                record.line_id,
                record.sequence_index,
                e
            );
        }
    }

    /// ラインの処理完了を通知
    ///
    /// 登録済み全ラインが完了したら終了タイムスタンプのフッタを書いて
    /// ファイルを閉じ、完了コールバックを呼ぶ。
    pub fn line_finished(&self, line_id: usize) {
        let all_done = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

            if !inner.registered.contains(&line_id) {
                log::warn!("未登録のラインから完了通知: line={}", line_id);
                return;
            }
            if !inner.finished.insert(line_id) {
                log::warn!("ラインから重複した完了通知: line={}", line_id);
                return;
            }

            log::debug!(
                "ライン完了: line={} ({}/{})",
                line_id,
                inner.finished.len(),
                inner.registered.len()
            );

            if inner.finished.len() == inner.registered.len() {
                Self::write_footer(&mut inner);
                true
            } else {
                false
            }
        };

        // コールバックはロックの外で呼ぶ
        if all_done {
            let slot = self.on_complete.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(callback) = slot.as_ref() {
                callback();
            }
        }
    }

    /// 出力ディレクトリのパス
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// 現在のセッション番号 (セッション未開始なら0)
    pub fn session_index(&self) -> u32 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.session_index
    }

    /// セッションが開いているか
    pub fn is_open(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.file.is_some()
    }

    fn write_footer(inner: &mut Inner) {
        if let Some(mut file) = inner.file.take() {
            let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
            let result = writeln!(file, "\nTranscription ended at {}", timestamp)
                .and_then(|_| file.flush())
                .and_then(|_| file.sync_data());
            if let Err(e) = result {
                log::error!("フッタの書き込みに失敗: {}", e);
            }
            log::info!("セッション終了: transcription-{}.txt", inner.session_index);
        }
    }
}

/// 出力ディレクトリをスキャンして次のセッション番号を決定
///
/// `transcription-{N}.txt` 形式のファイルのうち最大のNに1を足した値。
/// 形式に合わないファイルは無視する。
fn next_session_index(dir: &Path) -> Result<u32> {
    let mut max_index = 0u32;

    let entries = fs::read_dir(dir)
        .with_context(|| format!("出力ディレクトリの読み込みに失敗: {:?}", dir))?;

    for entry in entries {
        let entry = entry.context("ディレクトリエントリの読み込みに失敗")?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(index) = parse_session_index(name) {
            max_index = max_index.max(index);
        }
    }

    Ok(max_index + 1)
}

fn parse_session_index(name: &str) -> Option<u32> {
    let rest = name.strip_prefix("transcription-")?;
    let digits = rest.strip_suffix(".txt")?;
    digits.parse::<u32>().ok()
}
