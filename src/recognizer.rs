use crate::config::{CloudConfig, Config, RecognizerName};
use crate::types::SampleI16;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart;
use serde::Deserialize;
use std::io::Cursor;
use std::sync::Arc;

/// 音声認識バックエンドのトレイト
///
/// WAV形式のバイト列を受け取り、文字起こしテキストを返す。
/// バックエンドは設定読み込み時に `create_recognizer` で一度だけ
/// 選択され、以降チャンク毎の再選択は行わない。
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// WAVデータを文字起こし
    ///
    /// 空文字列は「音声なし」を表す正常な結果。
    async fn transcribe(&self, wav_data: Vec<u8>) -> Result<String>;

    /// バックエンド名（ログ用）
    fn name(&self) -> &'static str;
}

/// PCMデータをWAVフォーマット（モノラル/16bit）に変換
///
/// # Arguments
///
/// * `pcm_data` - 16ビットPCMサンプル列
/// * `sample_rate` - サンプリングレート (Hz)
pub fn pcm_to_wav(pcm_data: &[SampleI16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).context("WAVライター作成失敗")?;

        for &sample in pcm_data {
            writer.write_sample(sample).context("WAV書き込み失敗")?;
        }

        writer.finalize().context("WAV finalize失敗")?;
    }

    Ok(cursor.into_inner())
}

/// ダミー認識バックエンド
///
/// AI認識が無効な場合に使用する。チャンクのバイト数を含む
/// 決定的なテキストを返すため、パイプラインの動作確認に使える。
pub struct DummyRecognizer;

#[async_trait]
impl Recognizer for DummyRecognizer {
    async fn transcribe(&self, wav_data: Vec<u8>) -> Result<String> {
        Ok(format!("チャンク受信: {} バイト", wav_data.len()))
    }

    fn name(&self) -> &'static str {
        "dummy"
    }
}

/// クラウド文字起こしAPIレスポンス
#[derive(Debug, Deserialize)]
struct CloudResponse {
    text: String,
}

/// クラウド文字起こしバックエンド
///
/// OpenAI互換の文字起こしAPIへWAVデータをmultipartで送信する。
pub struct CloudRecognizer {
    config: CloudConfig,
    client: reqwest::Client,
}

impl CloudRecognizer {
    pub fn new(config: CloudConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .context("HTTPクライアント作成失敗")?;

        Ok(Self { config, client })
    }
}

#[async_trait]
impl Recognizer for CloudRecognizer {
    async fn transcribe(&self, wav_data: Vec<u8>) -> Result<String> {
        let part = multipart::Part::bytes(wav_data)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;

        let mut form = multipart::Form::new()
            .part("file", part)
            .text("model", self.config.model.clone());

        if let Some(ref language) = self.config.language {
            form = form.text("language", language.clone());
        }

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/transcriptions")
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .multipart(form)
            .send()
            .await
            .context("文字起こしAPI リクエスト失敗")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("文字起こしAPI エラー: {} - {}", status, error_text);
        }

        let cloud_response: CloudResponse = response
            .json::<CloudResponse>()
            .await
            .context("文字起こしAPI レスポンスパース失敗")?;

        Ok(cloud_response.text)
    }

    fn name(&self) -> &'static str {
        "cloud"
    }
}

/// ローカルWhisperバックエンド
///
/// whisper-rs でモデルをロードし、プロセス内で推論する。
/// 推論はブロッキング処理のため `spawn_blocking` で実行する。
#[cfg(feature = "offline-whisper")]
pub mod offline {
    use super::Recognizer;
    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    pub struct OfflineRecognizer {
        context: Arc<Mutex<WhisperContext>>,
    }

    impl OfflineRecognizer {
        /// モデルファイルをロードしてバックエンドを生成
        pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
            let path = model_path.as_ref();
            if !path.exists() {
                anyhow::bail!("モデルファイルが見つかりません: {:?}", path);
            }

            let path_str = path
                .to_str()
                .with_context(|| format!("モデルパスが不正です: {:?}", path))?;

            let context =
                WhisperContext::new_with_params(path_str, WhisperContextParameters::default())
                    .with_context(|| format!("Whisperモデルのロードに失敗: {:?}", path))?;

            log::info!("Whisperモデルをロードしました: {:?}", path);

            Ok(Self {
                context: Arc::new(Mutex::new(context)),
            })
        }

        fn transcribe_blocking(
            context: &Arc<Mutex<WhisperContext>>,
            wav_data: &[u8],
        ) -> Result<String> {
            // WAVをデコードしてf32に正規化
            let mut reader = hound::WavReader::new(std::io::Cursor::new(wav_data))
                .context("WAVデータのパースに失敗")?;
            let samples: Vec<f32> = reader
                .samples::<i16>()
                .map(|s| s.map(|v| v as f32 / 32768.0))
                .collect::<std::result::Result<_, _>>()
                .context("WAVサンプルの読み込みに失敗")?;

            let context = context
                .lock()
                .map_err(|e| anyhow::anyhow!("Whisperコンテキストのロック取得失敗: {}", e))?;

            let mut state = context
                .create_state()
                .context("Whisper state の作成に失敗")?;

            let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
            params.set_print_special(false);
            params.set_print_progress(false);
            params.set_print_realtime(false);
            params.set_print_timestamps(false);

            state.full(params, &samples).context("Whisper推論に失敗")?;

            let mut text = String::new();
            for segment in state.as_iter() {
                text.push_str(&segment.to_string());
            }

            Ok(text.trim().to_string())
        }
    }

    #[async_trait]
    impl Recognizer for OfflineRecognizer {
        async fn transcribe(&self, wav_data: Vec<u8>) -> Result<String> {
            let context = Arc::clone(&self.context);
            tokio::task::spawn_blocking(move || Self::transcribe_blocking(&context, &wav_data))
                .await
                .context("Whisper推論タスクの実行に失敗")?
        }

        fn name(&self) -> &'static str {
            "offline"
        }
    }
}

/// 設定から認識バックエンドを生成
///
/// バックエンドの選択はここで一度だけ行う。選択ロジック:
///
/// 1. `use_ai_recognition = true` または `recognizer_name = "offline"`
///    → ローカルWhisper（offline-whisperフィーチャが必要）
/// 2. `recognizer_name = "cloud"` → クラウドAPI（[cloud]設定が必要）
/// 3. それ以外 → ダミー
pub fn create_recognizer(config: &Config) -> Result<Arc<dyn Recognizer>> {
    let use_offline = config.recognizer.use_ai_recognition
        || config.recognizer.recognizer_name == RecognizerName::Offline;

    if use_offline {
        #[cfg(feature = "offline-whisper")]
        {
            let model_path = std::path::Path::new(&config.recognizer.model_cache_directory)
                .join(&config.recognizer.model_name);
            let recognizer = offline::OfflineRecognizer::new(model_path)?;
            return Ok(Arc::new(recognizer));
        }
        #[cfg(not(feature = "offline-whisper"))]
        {
            anyhow::bail!(
                "ローカルWhisperは offline-whisper フィーチャを有効にしてビルドしてください"
            );
        }
    }

    match config.recognizer.recognizer_name {
        RecognizerName::Cloud => {
            let cloud_config = config
                .cloud
                .clone()
                .context("recognizer_name = \"cloud\" には [cloud] 設定が必要です")?;
            let recognizer = CloudRecognizer::new(cloud_config)?;
            log::info!("クラウド文字起こしバックエンドを使用します");
            Ok(Arc::new(recognizer))
        }
        _ => {
            log::info!("ダミー認識バックエンドを使用します");
            Ok(Arc::new(DummyRecognizer))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_to_wav_roundtrip() {
        let pcm: Vec<i16> = vec![0, 100, -100, 32767, -32768];
        let wav_data = pcm_to_wav(&pcm, 16000).unwrap();

        let mut reader = hound::WavReader::new(Cursor::new(&wav_data)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 16000);
        assert_eq!(spec.bits_per_sample, 16);

        let decoded: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(decoded, pcm);
    }

    #[test]
    fn test_pcm_to_wav_empty() {
        let wav_data = pcm_to_wav(&[], 16000).unwrap();
        let reader = hound::WavReader::new(Cursor::new(&wav_data)).unwrap();
        assert_eq!(reader.len(), 0);
    }

    #[tokio::test]
    async fn test_dummy_recognizer_is_deterministic() {
        let recognizer = DummyRecognizer;
        let wav_data = pcm_to_wav(&vec![0i16; 1000], 16000).unwrap();
        let size = wav_data.len();

        let text = recognizer.transcribe(wav_data.clone()).await.unwrap();
        assert_eq!(text, format!("チャンク受信: {} バイト", size));

        // 同じ入力には同じ出力
        let text2 = recognizer.transcribe(wav_data).await.unwrap();
        assert_eq!(text, text2);
    }

    #[test]
    fn test_create_recognizer_default_is_dummy() {
        let config = Config::default();
        let recognizer = create_recognizer(&config).unwrap();
        assert_eq!(recognizer.name(), "dummy");
    }

    #[test]
    fn test_create_recognizer_cloud_requires_settings() {
        let mut config = Config::default();
        config.recognizer.recognizer_name = RecognizerName::Cloud;
        assert!(create_recognizer(&config).is_err());

        config.cloud = Some(CloudConfig {
            api_key: "sk-test".to_string(),
            model: "whisper-1".to_string(),
            language: Some("ja".to_string()),
            timeout_seconds: 30,
        });
        let recognizer = create_recognizer(&config).unwrap();
        assert_eq!(recognizer.name(), "cloud");
    }
}
