use crate::capture_queue::{capture_queue, CaptureConsumer, CaptureProducer};
use crate::types::DropPolicy;
use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Sample, SizedSample};
use regex_lite::Regex;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// read_next の1回分の結果
#[derive(Debug, PartialEq)]
pub enum SourceRead {
    /// サンプルブロック (空の場合あり = データ待ち)
    Samples(Vec<f32>),
    /// ストリーム終端。以降 read_next を呼んではならない
    EndOfStream,
}

/// 音声入力ソースのトレイト
///
/// ライブキャプチャ (デバイス) とWAVファイル読み込みを同じ
/// インタフェースで扱う。`open` してから `read_next` を繰り返し、
/// `EndOfStream` または `close` で終わる。
pub trait AudioSource: Send {
    fn open(&mut self) -> Result<()>;
    fn read_next(&mut self) -> Result<SourceRead>;
    fn close(&mut self) -> Result<()>;
}

/// ストリームスレッドの起動結果待ちのタイムアウト
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// read_next がデータを待つ時間
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// cpalデバイスからのライブ音声入力
///
/// cpal::Stream はスレッド間で移動できないため、ストリームは専用の
/// スレッドが生成して保持する。オーディオコールバックはサンプルを
/// f32のままキャプチャキューへ非ブロッキングで投入し、`read_next` が
/// キューから取り出す。
pub struct DeviceSource {
    device_name: String,
    sample_rate: u32,
    queue_capacity: usize,
    drop_policy: DropPolicy,
    consumer: Option<CaptureConsumer>,
    stop: Arc<AtomicBool>,
    /// ストリーム稼働中に発生したデバイスエラー。
    /// エラーコールバックが書き込み、read_next が取り出して返す
    stream_error: Arc<Mutex<Option<String>>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl DeviceSource {
    /// # Arguments
    ///
    /// * `device_name` - デバイス名 ("default" でデフォルト入力デバイス)
    /// * `sample_rate` - 要求するサンプリングレート (Hz)
    /// * `queue_capacity` - キャプチャキューの容量
    /// * `drop_policy` - キュー満杯時のドロップポリシー
    pub fn new(
        device_name: &str,
        sample_rate: u32,
        queue_capacity: usize,
        drop_policy: DropPolicy,
    ) -> Self {
        Self {
            device_name: device_name.to_string(),
            sample_rate,
            queue_capacity,
            drop_policy,
            consumer: None,
            stop: Arc::new(AtomicBool::new(false)),
            stream_error: Arc::new(Mutex::new(None)),
            thread: None,
        }
    }

    fn find_device(name: &str) -> Result<cpal::Device> {
        let host = cpal::default_host();
        if name == "default" {
            host.default_input_device()
                .context("デフォルト入力デバイスが見つかりません")
        } else {
            input_devices()?
                .into_iter()
                .find(|d| d.name().ok().as_deref() == Some(name))
                .with_context(|| format!("デバイスが見つかりません: {}", name))
        }
    }

    fn build_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        producer: CaptureProducer,
        stream_error: Arc<Mutex<Option<String>>>,
    ) -> Result<cpal::Stream>
    where
        T: SizedSample + Sample + Send + 'static,
        <T as Sample>::Float: Into<f32>,
    {
        let data_callback = move |data: &[T], _info: &cpal::InputCallbackInfo| {
            let mut block = Vec::with_capacity(data.len());
            for &sample in data {
                let f: f32 = sample.to_float_sample().into();
                block.push(f);
            }
            // コールバック内では決してブロックしない
            producer.push(block);
        };

        let error_callback = move |err: cpal::StreamError| {
            log::error!("ストリームエラー: {}", err);
            let mut slot = stream_error.lock().unwrap_or_else(|e| e.into_inner());
            // 最初のエラーを保持する
            slot.get_or_insert_with(|| err.to_string());
        };

        let stream = device
            .build_input_stream(config, data_callback, error_callback, None)
            .context("入力ストリームの構築に失敗")?;

        Ok(stream)
    }

    /// ストリームスレッド本体
    ///
    /// ストリームの生成と保持をこのスレッドで行い、成否を
    /// readyチャネルで報告する。停止フラグが立つまでストリームを
    /// 保持し続ける。
    fn stream_thread(
        device_name: String,
        sample_rate: u32,
        producer: CaptureProducer,
        stop: Arc<AtomicBool>,
        stream_error: Arc<Mutex<Option<String>>>,
        ready_tx: crossbeam_channel::Sender<Result<()>>,
    ) {
        let stream = (|| -> Result<cpal::Stream> {
            let device = Self::find_device(&device_name)?;
            log::info!("入力デバイス: {:?}", device.name());

            let default_config = device
                .default_input_config()
                .context("デフォルト入力設定が取得できません")?;

            log::info!(
                "デバイス設定: {:?}, {}Hz, {}ch",
                default_config.sample_format(),
                default_config.sample_rate().0,
                default_config.channels()
            );

            // モノラル・固定レートを要求する
            let config = cpal::StreamConfig {
                channels: 1,
                sample_rate: cpal::SampleRate(sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            let stream = match default_config.sample_format() {
                cpal::SampleFormat::F32 => {
                    Self::build_stream::<f32>(&device, &config, producer, stream_error)?
                }
                cpal::SampleFormat::I16 => {
                    Self::build_stream::<i16>(&device, &config, producer, stream_error)?
                }
                cpal::SampleFormat::U16 => {
                    Self::build_stream::<u16>(&device, &config, producer, stream_error)?
                }
                cpal::SampleFormat::I32 => {
                    Self::build_stream::<i32>(&device, &config, producer, stream_error)?
                }
                _ => anyhow::bail!("サポートされていないサンプルフォーマット"),
            };

            stream.play().context("ストリームの再生開始に失敗")?;
            Ok(stream)
        })();

        let stream = match stream {
            Ok(stream) => {
                let _ = ready_tx.send(Ok(()));
                stream
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };

        log::info!("音声入力ストリームを開始しました: {}", device_name);

        while !stop.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(100));
        }

        drop(stream);
        log::info!("音声入力ストリームを停止しました: {}", device_name);
    }
}

impl AudioSource for DeviceSource {
    fn open(&mut self) -> Result<()> {
        let (producer, consumer) = capture_queue(self.queue_capacity, self.drop_policy);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);

        let device_name = self.device_name.clone();
        let sample_rate = self.sample_rate;
        let stop = Arc::clone(&self.stop);
        let stream_error = Arc::clone(&self.stream_error);

        let handle = std::thread::Builder::new()
            .name(format!("capture-{}", self.device_name))
            .spawn(move || {
                Self::stream_thread(device_name, sample_rate, producer, stop, stream_error, ready_tx);
            })
            .context("ストリームスレッドの起動に失敗")?;

        // ストリームの生成結果を待つ
        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => {
                self.consumer = Some(consumer);
                self.thread = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                self.stop.store(true, Ordering::SeqCst);
                let _ = handle.join();
                anyhow::bail!("デバイス {} のオープンがタイムアウトしました", self.device_name)
            }
        }
    }

    fn read_next(&mut self) -> Result<SourceRead> {
        // デバイスエラーが起きていたらキューより先に報告する
        {
            let mut slot = self.stream_error.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(msg) = slot.take() {
                anyhow::bail!("デバイス {} のストリームエラー: {}", self.device_name, msg);
            }
        }

        let consumer = self
            .consumer
            .as_ref()
            .context("ソースがオープンされていません")?;
        match consumer.pop_timeout(READ_TIMEOUT) {
            Some(block) => Ok(SourceRead::Samples(block)),
            // データ待ち。空ブロックを返して呼び出し側に停止確認の機会を与える
            None => Ok(SourceRead::Samples(Vec::new())),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("ストリームスレッドの終了に失敗: {}", self.device_name);
            }
        }
        if let Some(consumer) = self.consumer.take() {
            let dropped = consumer.dropped_blocks();
            if dropped > 0 {
                log::warn!(
                    "デバイス {}: キュー満杯により {} ブロックを破棄しました",
                    self.device_name,
                    dropped
                );
            }
        }
        Ok(())
    }
}

impl Drop for DeviceSource {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.close();
        }
    }
}

/// WAVファイルからの音声入力
///
/// ファイルを先頭から順に読み、終端で `EndOfStream` を返す。
pub struct FileSource {
    path: PathBuf,
    reader: Option<hound::WavReader<BufReader<fs::File>>>,
    sample_rate: u32,
}

/// 1回の read_next で読むサンプル数
const FILE_BLOCK_SAMPLES: usize = 4096;

impl FileSource {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            reader: None,
            sample_rate: 0,
        }
    }

    /// ファイルのサンプリングレート (open後に有効)
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl AudioSource for FileSource {
    fn open(&mut self) -> Result<()> {
        let reader = hound::WavReader::open(&self.path)
            .with_context(|| format!("WAVファイルのオープンに失敗: {:?}", self.path))?;
        let spec = reader.spec();

        log::info!(
            "WAVファイル: {:?}, {}Hz, {}ch, {}bit",
            self.path,
            spec.sample_rate,
            spec.channels,
            spec.bits_per_sample
        );

        if spec.channels != 1 {
            anyhow::bail!("モノラルのWAVファイルのみ対応しています: {}ch", spec.channels);
        }

        self.sample_rate = spec.sample_rate;
        self.reader = Some(reader);
        Ok(())
    }

    fn read_next(&mut self) -> Result<SourceRead> {
        let reader = self
            .reader
            .as_mut()
            .context("ソースがオープンされていません")?;

        let mut block = Vec::with_capacity(FILE_BLOCK_SAMPLES);
        match reader.spec().sample_format {
            hound::SampleFormat::Int => {
                for sample in reader.samples::<i16>().take(FILE_BLOCK_SAMPLES) {
                    let v = sample.context("WAVサンプルの読み込みに失敗")?;
                    block.push(v as f32 / 32768.0);
                }
            }
            hound::SampleFormat::Float => {
                for sample in reader.samples::<f32>().take(FILE_BLOCK_SAMPLES) {
                    block.push(sample.context("WAVサンプルの読み込みに失敗")?);
                }
            }
        }

        if block.is_empty() {
            Ok(SourceRead::EndOfStream)
        } else {
            Ok(SourceRead::Samples(block))
        }
    }

    fn close(&mut self) -> Result<()> {
        self.reader = None;
        Ok(())
    }
}

/// デバイス一覧を表示
pub fn list_devices() -> Result<()> {
    println!("利用可能な入力デバイス:");
    println!();

    for (idx, device) in input_devices()?.into_iter().enumerate() {
        let name = device.name()?;
        println!("  [{}] {}", idx, name);

        device.supported_input_configs()?.for_each(|config_range| {
            println!(
                "      フォーマット: {:?}, {}-{}Hz, {}ch",
                config_range.sample_format(),
                config_range.min_sample_rate().0,
                config_range.max_sample_rate().0,
                config_range.channels()
            );
        });
        println!();
    }

    Ok(())
}

/// MacBook Air 本体・WebCam など、通常入力デバイスとして利用してはいけないデバイスを除外したデバイス一覧を取得
fn input_devices() -> Result<Vec<cpal::Device>> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()?
        .filter(|device| {
            if let Ok(name) = device.name() {
                // 除外するデバイス名のリスト
                let excluded_names_regex = Regex::new("MacBook (Air|Pro)|AirPods|iPhone|Webcam|Background|Microsoft Teams|ZoomAudioDevice").unwrap();
                if excluded_names_regex.is_match(&name) {
                    return false;
                }
                return true;
            } else {
                true
            }
        })
        .collect();
    Ok(devices)
}
