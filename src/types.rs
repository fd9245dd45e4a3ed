use serde::{Deserialize, Serialize};

/// 16ビット整数型のオーディオサンプル
///
/// PCM形式の音声データを表現するための型エイリアス。
/// -32768 から 32767 の範囲の値を取る。
pub type SampleI16 = i16;

/// ファイル一括文字起こしで使用する sequence_index のセンチネル値
///
/// ファイル全体を1チャンクとして扱うため、ライブキャプチャの
/// 連番とは衝突しない値を割り当てる。
pub const FILE_CHUNK_INDEX: u64 = u64::MAX;

/// オーディオフォーマット情報
///
/// 音声データのサンプリングレートとチャンネル数を保持する。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioFormat {
    /// サンプリングレート (Hz)
    ///
    /// パイプライン内部では 16000 Hz に統一する
    pub sample_rate: u32,

    /// チャンネル数
    ///
    /// 1: モノラル, 2: ステレオ
    pub channels: u16,
}

/// オーディオチャンク
///
/// 固定長に分割された1ライン分の音声データ。
/// ChunkAccumulator が生成し、TranscriptionWorker がちょうど1回消費する。
///
/// # 不変条件
///
/// 同一ライン内で `sequence_index` は 0 から始まり、欠番なく単調増加する。
/// ストリーム終端の最終チャンクを除き、チャンク長は一定。
#[derive(Clone, Debug)]
pub struct AudioChunk {
    /// ラインID
    pub line_id: usize,

    /// ライン毎の連番 (0始まり)
    pub sequence_index: u64,

    /// PCM音声サンプルの配列
    pub samples: Vec<SampleI16>,

    /// オーディオフォーマット情報
    pub format: AudioFormat,
}

impl AudioChunk {
    /// チャンクの長さ（秒）
    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / self.format.sample_rate as f64
    }
}

/// 文字起こし結果レコード
///
/// TranscriptionWorker が生成し、OutputWriter がちょうど1回消費する。
/// 空テキストは「音声なし」を表す正常な状態で、OutputWriter は
/// 空レコードをファイルへ書き出さない。
#[derive(Clone, Debug)]
pub struct TranscriptRecord {
    /// ラインID
    pub line_id: usize,

    /// 対応するチャンクの連番
    pub sequence_index: u64,

    /// 話者ラベル (設定されていない場合は None)
    pub speaker_label: Option<String>,

    /// 文字起こしテキスト (空の場合あり)
    pub text: String,
}

impl TranscriptRecord {
    /// 書き出す価値のあるテキストを持たないレコードかどうか
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// TranscriptionWorker の状態
///
/// `Idle → Running → Draining → Stopped` の順に遷移する。
/// Draining 中はキューに残る全チャンクをFIFO順で処理しきってから
/// Stopped に遷移する。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineState {
    /// 未起動
    Idle,
    /// チャンクを処理中
    Running,
    /// 停止要求を受け、キューを排出中
    Draining,
    /// 全チャンク処理完了
    Stopped,
}

/// パイプライン全体の状態
///
/// PipelineCoordinator が全ラインの状態を集約したもの。
/// Stopping は全ラインが Stopped に達するまで維持される。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// キャプチャキューが満杯になった場合のドロップポリシー
///
/// オーディオドライバのコールバックは決してブロックしてはならないため、
/// キュー満杯時にどのデータを破棄するかを明示的に指定する。
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// 最古のブロックから破棄
    ///
    /// リアルタイムキャプチャでは通常これを使用する
    DropOldest,

    /// 最新のブロックを破棄
    DropNewest,
}

/// float32サンプル1つを16ビットPCMに変換
///
/// `round(sample * 32767)` を有効なint16範囲にクランプする。
/// 範囲外の入力はラップアラウンドせず飽和する。
///
/// # Examples
///
/// ```
/// # use line_transcribe::types::f32_to_i16;
/// assert_eq!(f32_to_i16(0.0), 0);
/// assert_eq!(f32_to_i16(1.0), 32767);
/// assert_eq!(f32_to_i16(2.0), 32767);
/// ```
pub fn f32_to_i16(sample: f32) -> i16 {
    let scaled = (sample * 32767.0).round();
    scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// float32サンプル列を16ビットPCM列に変換
pub fn convert_samples(samples: &[f32]) -> Vec<SampleI16> {
    samples.iter().map(|&s| f32_to_i16(s)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_chunk_duration() {
        let chunk = AudioChunk {
            line_id: 0,
            sequence_index: 0,
            samples: vec![0i16; 8000],
            format: AudioFormat {
                sample_rate: 16000,
                channels: 1,
            },
        };
        assert!((chunk.duration_seconds() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_transcript_record_is_blank() {
        let mut record = TranscriptRecord {
            line_id: 0,
            sequence_index: 3,
            speaker_label: Some("A".to_string()),
            text: String::new(),
        };
        assert!(record.is_blank());

        record.text = "   \t".to_string();
        assert!(record.is_blank());

        record.text = "こんにちは".to_string();
        assert!(!record.is_blank());
    }

    #[test]
    fn test_f32_to_i16_zero() {
        // 全ゼロのバッファは全ゼロのint16バッファに変換される
        let converted = convert_samples(&[0.0f32; 100]);
        assert!(converted.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_f32_to_i16_full_scale() {
        // +1.0/-1.0 は round(±32767) になる
        assert_eq!(f32_to_i16(1.0), 32767);
        assert_eq!(f32_to_i16(-1.0), -32767);
    }

    #[test]
    fn test_f32_to_i16_out_of_range_saturates() {
        // 範囲外の入力はラップアラウンドせず飽和する
        assert_eq!(f32_to_i16(2.0), i16::MAX);
        assert_eq!(f32_to_i16(100.0), i16::MAX);
        assert_eq!(f32_to_i16(-2.0), i16::MIN);
        assert_eq!(f32_to_i16(-100.0), i16::MIN);
    }

    #[test]
    fn test_f32_to_i16_rounds() {
        // 0.5 * 32767 = 16383.5 → 四捨五入で 16384
        assert_eq!(f32_to_i16(0.5), 16384);
    }

    #[test]
    fn test_drop_policy_roundtrip() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            policy: DropPolicy,
        }

        let toml = toml::to_string(&Wrapper {
            policy: DropPolicy::DropOldest,
        })
        .unwrap();
        assert!(toml.contains("drop_oldest"));

        let parsed: Wrapper = toml::from_str("policy = \"drop_newest\"").unwrap();
        assert_eq!(parsed.policy, DropPolicy::DropNewest);
    }
}
