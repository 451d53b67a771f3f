// Static-stage throughput benchmark
// Measures extraction and policy compilation on representative model output.
// Neither stage starts a worker, so this runs without python3.

use fencebox::{extract, presets, Policy, PolicyCompiler};
use std::hint::black_box;
use std::time::{Duration, Instant};

const ITERATIONS: usize = 2_000;
const WARMUP_ITERATIONS: usize = 100;

const CHAT_REPLY: &str = r#"Here is a quick analysis of the numbers you sent.

```python
import math
import statistics

values = [3, 1, 4, 1, 5, 9, 2, 6, 5, 3, 5]
mean = statistics.mean(values)
spread = statistics.pstdev(values)

def zscore(x):
    return (x - mean) / spread if spread else 0.0

scores = {v: round(zscore(v), 3) for v in sorted(set(values))}
for value, score in scores.items():
    print(f"{value:>3} -> {score:+.3f}")

result = math.fsum(values)
```

And the same idea in JavaScript, in case you need it:

```js
const values = [3, 1, 4];
```
"#;

const HOSTILE_REPLY: &str = r#"```python
import os, subprocess
getattr(os, "sys" + "tem")("id")
().__class__.__bases__[0].__subclasses__()
eval("1 + 1")
```"#;

struct LatencyStats {
    p50: Duration,
    p95: Duration,
    p99: Duration,
    mean: Duration,
}

impl LatencyStats {
    fn from_samples(mut samples: Vec<Duration>) -> Self {
        samples.sort();
        let len = samples.len();
        let sum: Duration = samples.iter().sum();

        Self {
            p50: samples[len / 2],
            p95: samples[len * 95 / 100],
            p99: samples[len * 99 / 100],
            mean: sum / len as u32,
        }
    }

    fn print(&self, label: &str) {
        println!("\n{}", label);
        println!("  p50:  {:?}", self.p50);
        println!("  p95:  {:?}", self.p95);
        println!("  p99:  {:?}", self.p99);
        println!("  mean: {:?}", self.mean);
    }
}

fn measure<F: FnMut()>(mut body: F) -> LatencyStats {
    for _ in 0..WARMUP_ITERATIONS {
        body();
    }

    let samples = (0..ITERATIONS)
        .map(|_| {
            let start = Instant::now();
            body();
            start.elapsed()
        })
        .collect();
    LatencyStats::from_samples(samples)
}

fn main() {
    let compiler = PolicyCompiler::default();
    let standard = Policy::default();
    let data_science = presets::data_science();

    println!("fencebox static pipeline benchmark ({} iterations)", ITERATIONS);

    measure(|| {
        black_box(extract(black_box(CHAT_REPLY)).count());
    })
    .print("extract: chat reply with two fences");

    let fragment = match extract(CHAT_REPLY).next() {
        Some(fragment) => fragment,
        None => {
            eprintln!("benchmark input has no Python fragment");
            std::process::exit(1);
        }
    };

    measure(|| {
        black_box(compiler.compile(black_box(&fragment), &standard).is_ok());
    })
    .print("compile: clean fragment, standard policy");

    measure(|| {
        black_box(compiler.compile(black_box(&fragment), &data_science).is_ok());
    })
    .print("compile: clean fragment, data_science policy");

    let hostile = match extract(HOSTILE_REPLY).next() {
        Some(fragment) => fragment,
        None => {
            eprintln!("benchmark input has no Python fragment");
            std::process::exit(1);
        }
    };
    let violations = compiler.check(&hostile.text, &standard).len();

    measure(|| {
        black_box(compiler.compile(black_box(&hostile), &standard).is_err());
    })
    .print(&format!("compile: hostile fragment ({} violations)", violations));
}
