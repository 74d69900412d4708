//! Tracing subscriber setup.

use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LogFormat;

/// Install the global subscriber. `RUST_LOG` takes precedence over `level`.
pub fn init(level: &str, format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer(format, std::io::stdout))
        .try_init()?;

    Ok(())
}

fn fmt_layer<S, W>(format: LogFormat, writer: W) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer().with_writer(writer);
    match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Pretty => layer.pretty().boxed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn render(format: LogFormat) -> String {
        let capture = Capture(Arc::new(Mutex::new(Vec::new())));
        let sink = capture.clone();
        let subscriber =
            tracing_subscriber::registry().with(fmt_layer(format, move || sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(backend_addr = "10.0.0.1:80", alive = true, "Health check result");
        });

        let bytes = capture.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_json_format_emits_one_object_per_event() {
        let output = render(LogFormat::Json);
        let event: serde_json::Value = serde_json::from_str(output.trim()).unwrap();

        assert_eq!(event["fields"]["message"], "Health check result");
        assert_eq!(event["fields"]["backend_addr"], "10.0.0.1:80");
    }

    #[test]
    fn test_pretty_format_spans_several_lines() {
        let output = render(LogFormat::Pretty);

        assert!(!output.trim_start().starts_with('{'));
        assert!(output.contains("Health check result"));
        assert!(output.trim_end().lines().count() > 1, "{output}");
    }
}
