use crate::types::DropPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub recognizer: RecognizerConfig,
    pub cloud: Option<CloudConfig>,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub lines: Vec<LineConfig>,
}

/// オーディオ入力設定
///
/// キャプチャとチャンク分割に関する設定。
///
/// # デフォルト値
///
/// - `sample_rate`: 16000 Hz (16kHz - 音声認識の標準値)
/// - `chunk_duration_seconds`: 5.0 秒
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_chunk_duration_seconds")]
    pub chunk_duration_seconds: f64,
}

/// キャプチャキュー設定
///
/// オーディオドライバのコールバックとアキュムレータループの間の
/// 有界キューに関する設定。コールバックは決してブロックしないため、
/// 満杯時の挙動はドロップポリシーで明示する。
///
/// # デフォルト値
///
/// - `queue_capacity`: 64 ブロック
/// - `drop_policy`: DropOldest
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_drop_policy")]
    pub drop_policy: DropPolicy,
}

/// 認識バックエンドの種類
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecognizerName {
    /// ダミー認識（チャンクのバイト数を返す）
    Dummy,
    /// ローカルWhisperモデル
    Offline,
    /// クラウド文字起こしAPI
    Cloud,
}

/// 音声認識設定
///
/// バックエンドは設定読み込み時に一度だけ選択され、
/// チャンク毎に再ディスパッチされることはない。
///
/// # デフォルト値
///
/// - `use_ai_recognition`: false
/// - `recognizer_name`: "dummy"
/// - `model_cache_directory`: "./models"
/// - `model_name`: "ggml-base.bin"
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecognizerConfig {
    /// AI認識を使用するか
    ///
    /// true の場合は recognizer_name に関わらずローカルWhisperを使用する
    #[serde(default)]
    pub use_ai_recognition: bool,
    #[serde(default = "default_recognizer_name")]
    pub recognizer_name: RecognizerName,
    /// モデルファイルのキャッシュディレクトリ
    #[serde(default = "default_model_cache_directory")]
    pub model_cache_directory: String,
    /// モデルファイル名
    #[serde(default = "default_model_name")]
    pub model_name: String,
}

/// クラウド文字起こしAPI設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloudConfig {
    /// API Key
    pub api_key: String,
    /// モデル名（通常 "whisper-1"）
    #[serde(default = "default_cloud_model")]
    pub model: String,
    /// 言語コード（"ja", "en" など）。省略可能
    pub language: Option<String>,
    /// リクエストタイムアウト（秒）
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

/// 出力設定
///
/// 文字起こしファイルと録音WAVファイルの出力先。
///
/// # デフォルト値
///
/// - `output_directory`: "./output"
/// - `log_level`: "info"
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_directory")]
    pub output_directory: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// 入力ライン個別設定
///
/// 1つの音声入力（デバイス）とその話者ラベル、録音/文字起こしの
/// 有効無効を設定する。実行中は不変。
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LineConfig {
    #[serde(default = "default_device")]
    pub device: String,
    pub speaker_label: String,
    #[serde(default)]
    pub record: bool,
    #[serde(default = "default_transcribe")]
    pub transcribe: bool,
}

impl LineConfig {
    /// 録音か文字起こしの少なくとも一方が有効なら起動対象
    pub fn is_runnable(&self) -> bool {
        self.record || self.transcribe
    }
}

// Default functions
fn default_sample_rate() -> u32 {
    16000 // 16kHz - 音声認識の標準値
}

fn default_chunk_duration_seconds() -> f64 {
    5.0
}

fn default_queue_capacity() -> usize {
    64
}

fn default_drop_policy() -> DropPolicy {
    DropPolicy::DropOldest
}

fn default_recognizer_name() -> RecognizerName {
    RecognizerName::Dummy
}

fn default_model_cache_directory() -> String {
    "./models".to_string()
}

fn default_model_name() -> String {
    "ggml-base.bin".to_string()
}

fn default_cloud_model() -> String {
    "whisper-1".to_string()
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_output_directory() -> String {
    "./output".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_device() -> String {
    "default".to_string()
}

fn default_transcribe() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            capture: CaptureConfig::default(),
            recognizer: RecognizerConfig::default(),
            cloud: None, // デフォルトではクラウド設定なし
            output: OutputConfig::default(),
            lines: vec![LineConfig {
                device: default_device(),
                speaker_label: "A".to_string(),
                record: false,
                transcribe: true,
            }],
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            chunk_duration_seconds: default_chunk_duration_seconds(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            drop_policy: default_drop_policy(),
        }
    }
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            use_ai_recognition: false,
            recognizer_name: default_recognizer_name(),
            model_cache_directory: default_model_cache_directory(),
            model_name: default_model_name(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_directory: default_output_directory(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// 設定ファイルから読み込み
    ///
    /// TOML形式の設定ファイルをパースしてConfig構造体を生成する。
    ///
    /// # Errors
    ///
    /// ファイルの読み込みまたはパースに失敗した場合にエラーを返す。
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("設定ファイルの読み込みに失敗: {:?}", path.as_ref()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "設定ファイルのパースに失敗")?;
        Ok(config)
    }

    /// デフォルト設定をファイルに書き出し
    ///
    /// 既存のファイルは上書きされる。
    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<()> {
        let config = Config::default();
        let content =
            toml::to_string_pretty(&config).with_context(|| "設定のシリアライズに失敗")?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("設定ファイルの書き込みに失敗: {:?}", path.as_ref()))?;
        Ok(())
    }

    /// 設定ファイルがあれば読み込み、なければデフォルトを使用
    ///
    /// ファイルが存在するがパースに失敗した場合はエラーを返す。
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            log::warn!(
                "設定ファイルが見つかりません。デフォルト設定を使用します: {:?}",
                path.as_ref()
            );
            Ok(Config::default())
        }
    }

    /// 設定値の検証
    ///
    /// 設定エラーはパイプライン起動前にここで報告する。
    /// 実行時エラーとして扱われることはない。
    ///
    /// # Errors
    ///
    /// - チャンク長が0以下または非数
    /// - サンプリングレートが0
    /// - キャプチャキュー容量が0
    /// - 出力ディレクトリが未設定
    /// - クラウドバックエンド指定なのにクラウド設定なし
    pub fn validate(&self) -> Result<()> {
        if !self.audio.chunk_duration_seconds.is_finite()
            || self.audio.chunk_duration_seconds <= 0.0
        {
            anyhow::bail!(
                "chunk_duration_seconds は正の数である必要があります: {}",
                self.audio.chunk_duration_seconds
            );
        }

        if self.audio.sample_rate == 0 {
            anyhow::bail!("sample_rate は 0 にできません");
        }

        if self.capture.queue_capacity == 0 {
            anyhow::bail!("capture.queue_capacity は 0 にできません");
        }

        if self.output.output_directory.trim().is_empty() {
            anyhow::bail!("output_directory が設定されていません");
        }

        if self.recognizer.recognizer_name == RecognizerName::Cloud
            && !self.recognizer.use_ai_recognition
            && self.cloud.is_none()
        {
            anyhow::bail!("recognizer_name = \"cloud\" には [cloud] 設定が必要です");
        }

        Ok(())
    }

    /// 起動対象（録音か文字起こしが有効）のライン数
    pub fn runnable_lines(&self) -> usize {
        self.lines.iter().filter(|l| l.is_runnable()).count()
    }
}
