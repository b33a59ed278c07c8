use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use vision_camera::{
    image::{self, FrameBuffer},
    jpeg::{encode_jpeg, JpegEncoder},
};

fn frame(width: u32, height: u32, format: image::FourCC) -> FrameBuffer {
    let size = image::frame_size(format, width, height).unwrap();
    let data = (0..size).map(|i| (i % 251) as u8).collect();
    FrameBuffer::new(data, width, height, format)
}

pub fn benchmark_encode(c: &mut Criterion) {
    for format in [image::RGB3, image::YUYV, image::RGBP] {
        let mut group = c.benchmark_group(format!("jpeg/{format}"));
        for dim in [(160, 120), (320, 240), (640, 480), (800, 600), (1600, 1200)].iter() {
            let img = frame(dim.0, dim.1, format);
            group.bench_with_input(format!("{}x{}", dim.0, dim.1), &img, |b, img| {
                b.iter(|| encode_jpeg(img, 80).unwrap())
            });
        }
        group.finish();
    }
}

pub fn benchmark_encode_async(c: &mut Criterion) {
    let mut group = c.benchmark_group("jpeg-async");
    for dim in [(320, 240), (640, 480), (1600, 1200)].iter() {
        let img = Arc::new(frame(dim.0, dim.1, image::RGB3));
        let mut encoder = JpegEncoder::new(80);
        group.bench_with_input(format!("{}x{}", dim.0, dim.1), &img, |b, img| {
            b.iter(|| {
                let mut stream = encoder.encode_async(img.clone());
                let jpeg = stream.read_to_end().unwrap();
                encoder.join();
                jpeg
            })
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_encode, benchmark_encode_async);
criterion_main!(benches);
