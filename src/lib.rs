//! line-transcribe - マルチライン音声文字起こしパイプライン
//!
//! このクレートは、複数の音声入力ライン（デバイスまたはWAVファイル）から
//! 音声をキャプチャし、固定長チャンクに分割してライン毎のワーカーで
//! 文字起こしし、結果を1つのセッションファイルへ書き出すシステムを
//! 提供します。
//!
//! # 主な機能
//!
//! - **マルチライン入力**: 複数の入力デバイスを並列にキャプチャ
//! - **チャンク分割**: 固定長チャンク + ストリーム終端の部分チャンク
//! - **ライン毎ワーカー**: 停止時もキューを排出しきってから終了
//! - **共有出力**: 話者ラベル付きで1つの `transcription-{N}.txt` に集約
//! - **WAV録音**: 文字起こしと並行してライン毎の生音声を保存
//! - **複数バックエンド**: ダミー / ローカルWhisper / クラウドAPI
//!
//! # アーキテクチャ
//!
//! ```text
//! [Device/File] → [AudioSource] → [CaptureQueue]
//!                                       ↓
//!                               [ChunkAccumulator]   (×N ライン)
//!                                       ↓
//!                             ┌─────────┴─────────┐
//!                             │                   │
//!                    [TranscriptionWorker]    [Recorder]
//!                             │                   │
//!                             ↓                   ↓
//!                       [Recognizer]         [WAV Files]
//!                             │
//!                             ↓
//!                       [OutputWriter] → transcription-{N}.txt
//! ```
//!
//! # 使用例
//!
//! ```no_run
//! use line_transcribe::config::Config;
//!
//! // 設定ファイルを読み込み
//! let config = Config::load_or_default("config.toml").unwrap();
//!
//! // またはデフォルト設定を生成
//! Config::write_default("config.toml").unwrap();
//! ```

pub mod audio_source;
pub mod capture_queue;
pub mod chunker;
pub mod config;
pub mod coordinator;
pub mod output_writer;
pub mod recognizer;
pub mod recorder;
pub mod types;
pub mod worker;
