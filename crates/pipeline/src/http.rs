use reqwest::Client;
use std::time::Duration;
use url::Url;

pub(crate) fn build_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder().timeout(timeout).build()
}

/// Appends path segments to `base`, percent-encoding each one. Segments that
/// contain slashes are split so hierarchical paths can be passed whole.
pub(crate) fn join_url<'a>(
    base: &str,
    segments: impl IntoIterator<Item = &'a str>,
) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(base)?;
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|()| url::ParseError::RelativeUrlWithCannotBeABaseBase)?;
        path.pop_if_empty();
        for segment in segments {
            path.extend(segment.split('/').filter(|part| !part.is_empty()));
        }
    }
    Ok(url)
}
