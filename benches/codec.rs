/*
 * Copyright (C) 2024 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use sncp::codec::{encode_frame, FrameReader, Header, Mode, Progress, DEFAULT_MAX_BODY};
use sncp::core::buffer::BufferPool;

const FRAMES_PER_ITER: usize = 100;

fn frames(body_size: usize) -> Vec<u8> {
    let body = vec![b'x'; body_size];

    let mut out = Vec::new();

    for i in 0..FRAMES_PER_ITER {
        let header = Header {
            seqid: i as i64 + 1,
            service_id: 0xec40,
            action_id: 1,
            ..Default::default()
        };

        encode_frame(&header, &body, &mut out).unwrap();
    }

    out
}

fn decode_all(reader: &mut FrameReader, mut src: &[u8], chunk: usize) -> usize {
    let mut count = 0;

    while !src.is_empty() {
        let end = chunk.min(src.len());
        let (size, progress) = reader.read(&src[..end]).unwrap();
        src = &src[size..];

        if progress == Progress::Complete {
            reader.take_frame().unwrap();
            count += 1;
        }
    }

    count
}

fn criterion_benchmark(c: &mut Criterion) {
    for body_size in [0, 1024] {
        c.bench_function(&format!("encode x{FRAMES_PER_ITER} body={body_size}"), |b| {
            let body = vec![b'x'; body_size];
            let header = Header::default();
            let mut out = Vec::with_capacity((body_size + 60) * FRAMES_PER_ITER);

            b.iter(|| {
                out.clear();

                for _ in 0..FRAMES_PER_ITER {
                    encode_frame(&header, &body, &mut out).unwrap();
                }
            })
        });

        let data = frames(body_size);

        for chunk in [data.len(), 16] {
            c.bench_function(
                &format!("decode x{FRAMES_PER_ITER} body={body_size} chunk={chunk}"),
                |b| {
                    b.iter_batched_ref(
                        || FrameReader::new(Mode::Request, DEFAULT_MAX_BODY),
                        |reader| assert_eq!(decode_all(reader, &data, chunk), FRAMES_PER_ITER),
                        BatchSize::SmallInput,
                    )
                },
            );
        }
    }

    {
        let pool = BufferPool::new(16 * 1024, 64);

        c.bench_function("buffer pool take x1000", |b| {
            b.iter(|| {
                for _ in 0..1000 {
                    let buf = pool.take();
                    assert!(buf.capacity() >= 16 * 1024);
                }
            })
        });
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
