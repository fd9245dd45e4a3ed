use crate::types::{AudioChunk, AudioFormat, SampleI16};

/// チャンクアキュムレータ
///
/// 可変長のサンプルブロックを受け取り、固定長のAudioChunkに組み立てる。
/// `sequence_index` はライン毎に 0 から始まる欠番のない連番を割り当てる。
///
/// # Examples
///
/// ```
/// # use line_transcribe::chunker::ChunkAccumulator;
/// let mut acc = ChunkAccumulator::new(0, 1.0, 16000);
/// let chunks = acc.push(&vec![0i16; 16000]);
/// assert_eq!(chunks.len(), 1);
/// assert_eq!(chunks[0].sequence_index, 0);
/// ```
pub struct ChunkAccumulator {
    line_id: usize,
    samples_per_chunk: usize,
    format: AudioFormat,
    buffer: Vec<SampleI16>,
    next_index: u64,
}

impl ChunkAccumulator {
    /// 新しいアキュムレータを生成
    ///
    /// # Arguments
    ///
    /// * `line_id` - ラインID
    /// * `chunk_duration_seconds` - 1チャンクの長さ（秒）。正の有限値であること
    /// * `sample_rate` - サンプリングレート (Hz)
    pub fn new(line_id: usize, chunk_duration_seconds: f64, sample_rate: u32) -> Self {
        let samples_per_chunk = (chunk_duration_seconds * sample_rate as f64) as usize;
        Self {
            line_id,
            // 設定検証をすり抜けた異常値でも0除算相当の無限ループは避ける
            samples_per_chunk: samples_per_chunk.max(1),
            format: AudioFormat {
                sample_rate,
                channels: 1,
            },
            buffer: Vec::with_capacity(samples_per_chunk.max(1)),
            next_index: 0,
        }
    }

    /// サンプルを追加し、完成したチャンクをすべて返す
    ///
    /// 入力ブロックが大きい場合は複数チャンクが一度に完成することがある。
    /// チャンク境界に満たない残りは内部バッファに保持される。
    pub fn push(&mut self, samples: &[SampleI16]) -> Vec<AudioChunk> {
        self.buffer.extend_from_slice(samples);

        let mut completed = Vec::new();
        while self.buffer.len() >= self.samples_per_chunk {
            let rest = self.buffer.split_off(self.samples_per_chunk);
            let chunk_samples = std::mem::replace(&mut self.buffer, rest);
            completed.push(self.make_chunk(chunk_samples));
        }
        completed
    }

    /// ストリーム終端処理
    ///
    /// バッファに残った端数サンプルを最終の部分チャンクとして返す。
    /// 残りがなければ None。
    pub fn finish(&mut self) -> Option<AudioChunk> {
        if self.buffer.is_empty() {
            return None;
        }
        let samples = std::mem::take(&mut self.buffer);
        Some(self.make_chunk(samples))
    }

    /// 現在バッファに溜まっているサンプル数
    pub fn pending_samples(&self) -> usize {
        self.buffer.len()
    }

    fn make_chunk(&mut self, samples: Vec<SampleI16>) -> AudioChunk {
        let chunk = AudioChunk {
            line_id: self.line_id,
            sequence_index: self.next_index,
            samples,
            format: self.format,
        };
        self.next_index += 1;
        chunk
    }
}
