use bb_downloader::Downloader;

use crate::FirmwareFetcher;

impl FirmwareFetcher for Downloader {
    async fn fetch(&self, locator: &str) -> anyhow::Result<Vec<u8>> {
        let data = self.download(locator, None).await?;
        Ok(data)
    }
}
