use crate::types::SampleI16;
use anyhow::{Context, Result};
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// ライン毎のWAV録音
///
/// 文字起こしと並行して、ラインの生音声を
/// `rec-{セッション番号}-{話者ラベル}.wav` に保存する。
/// モノラル・16ビット・パイプラインのサンプリングレート。
pub struct Recorder {
    line_id: usize,
    speaker_label: String,
    output_dir: PathBuf,
    writer: Option<hound::WavWriter<BufWriter<fs::File>>>,
    spec: hound::WavSpec,
    samples_written: usize,
}

impl Recorder {
    pub fn new<P: AsRef<Path>>(
        line_id: usize,
        speaker_label: &str,
        output_dir: P,
        sample_rate: u32,
    ) -> Result<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();

        // 出力ディレクトリが存在しない場合は作成
        if !output_dir.exists() {
            fs::create_dir_all(&output_dir)
                .with_context(|| format!("出力ディレクトリの作成に失敗: {:?}", output_dir))?;
        }

        let spec = hound::WavSpec {
            channels: 1, // モノラル（各ライン個別に保存）
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        Ok(Self {
            line_id,
            speaker_label: speaker_label.to_string(),
            output_dir,
            writer: None,
            spec,
            samples_written: 0,
        })
    }

    /// 録音ファイルを開始
    ///
    /// セッション番号と話者ラベルからファイル名を決定する。
    pub fn start(&mut self, session_index: u32) -> Result<()> {
        let filename = format!("rec-{}-{}.wav", session_index, self.speaker_label);
        let filepath = self.output_dir.join(&filename);

        log::info!("録音ファイル作成: {:?}", filepath);

        let writer = hound::WavWriter::create(&filepath, self.spec)
            .with_context(|| format!("録音ファイルの作成に失敗: {:?}", filepath))?;

        self.writer = Some(writer);
        self.samples_written = 0;

        Ok(())
    }

    /// サンプルを書き込み
    ///
    /// # Errors
    ///
    /// `start` 前に呼ばれた場合、または書き込みに失敗した場合。
    pub fn write_samples(&mut self, samples: &[SampleI16]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .context("録音が開始されていません")?;

        for &sample in samples {
            writer
                .write_sample(sample)
                .with_context(|| "録音ファイルへのサンプル書き込みに失敗")?;
        }
        self.samples_written += samples.len();

        Ok(())
    }

    /// 現在のファイルを終了
    pub fn finalize(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer
                .finalize()
                .with_context(|| "録音ファイルのファイナライズに失敗")?;
            log::info!(
                "録音完了: ライン {}, {}サンプル ({:.2}秒)",
                self.line_id,
                self.samples_written,
                self.samples_written as f64 / self.spec.sample_rate as f64
            );
        }
        Ok(())
    }

    /// 書き込んだサンプル数
    pub fn samples_written(&self) -> usize {
        self.samples_written
    }

    /// 書き込んだ時間（秒）
    pub fn duration_seconds(&self) -> f64 {
        self.samples_written as f64 / self.spec.sample_rate as f64
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.writer.is_some() {
            if let Err(e) = self.finalize() {
                log::error!("Recorder のドロップ時にエラー: {}", e);
            }
        }
    }
}
