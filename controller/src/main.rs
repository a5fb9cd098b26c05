mod clock;
mod replies;

#[cfg(feature = "esp32")]
mod esp;

#[cfg(not(feature = "esp32"))]
mod cloud;
#[cfg(not(feature = "esp32"))]
mod files;
#[cfg(not(feature = "esp32"))]
mod host;
#[cfg(not(feature = "esp32"))]
mod http;
#[cfg(not(feature = "esp32"))]
mod ingress;
#[cfg(not(feature = "esp32"))]
mod mailbox;
#[cfg(not(feature = "esp32"))]
mod tcp;
#[cfg(not(feature = "esp32"))]
mod timer;

#[cfg(not(feature = "esp32"))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}

#[cfg(feature = "esp32")]
fn main() -> anyhow::Result<()> {
    esp::run()
}
