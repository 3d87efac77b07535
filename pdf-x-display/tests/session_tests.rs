//! End-to-end session tests: a loopback worker, a host-fed byte source and
//! progressive rendering onto in-memory surfaces.

mod test_utils;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use pdf_x_display::core::text_content::TextContentParams;
use pdf_x_display::core::*;
use pdf_x_display::rendering::TestDevice;
use test_utils::*;

const DOCUMENT_LENGTH: usize = 300_000;

fn surface() -> DrawingSurface {
    DrawingSurface::new(TestDevice::new(PAGE_SIZE as u32, PAGE_SIZE as u32))
}

#[tokio::test]
async fn test_range_transport_session_renders_every_page() {
    let data = sample_bytes(DOCUMENT_LENGTH);
    let (transport, requests) = serving_transport(data.clone(), 65_536);
    let provider = StripeProvider::with_padding(3, 200);
    let worker = PDFWorker::loopback(provider.clone()).unwrap();

    let task = get_document(
        DocumentSource::RangeTransport(Arc::clone(&transport)),
        DocumentOptions::default(),
        worker,
    );
    let document = task.promise().await.unwrap();
    assert_eq!(task.state(), SessionState::Ready);
    assert_eq!(document.num_pages(), 3);
    assert_eq!(document.fingerprint(), Some("5f2c0e"));

    // The worker assembled the whole document from the initial push plus
    // ranged requests.
    assert_eq!(provider.received().unwrap(), data);
    assert!(!requests.lock().unwrap().is_empty());
    assert_eq!(document.get_download_info().await.unwrap(), DOCUMENT_LENGTH as u64);

    // The full reader negotiated ranges for the whole length.
    let headers = document.reader_headers().unwrap();
    assert!(headers.is_range_supported);
    assert!(headers.is_streaming_supported);
    assert_eq!(headers.content_length, Some(DOCUMENT_LENGTH as u64));
    let metadata = document.get_metadata().await.unwrap();
    assert_eq!(metadata.content_length, Some(DOCUMENT_LENGTH as u64));

    for page_number in 1..=3 {
        let page = document.get_page(page_number).await.unwrap();
        let viewport = page.get_viewport(1.0, None).unwrap();
        let target = surface();

        let slices = Arc::new(AtomicUsize::new(0));
        let ready_before_step = Arc::new(AtomicBool::new(true));
        let observed = page.clone();
        let runtime = tokio::runtime::Handle::current();
        let params = RenderParameters::new(target.clone(), viewport).with_on_continue({
            let slices = Arc::clone(&slices);
            let ready_before_step = Arc::clone(&ready_before_step);
            move |job| {
                slices.fetch_add(1, Ordering::SeqCst);
                if !observed.is_display_ready(RenderIntent::Display) {
                    ready_before_step.store(false, Ordering::SeqCst);
                }
                runtime.spawn(async move { job() });
            }
        });

        let render = page.render(params).unwrap();
        render.promise().await.unwrap();
        // Settled promises keep their value.
        render.promise().await.unwrap();
        assert!(render.is_settled());

        assert!(slices.load(Ordering::SeqCst) >= 1);
        assert!(ready_before_step.load(Ordering::SeqCst));
        let pixel = target.with_device(|device| device.get_image_data().data.slice(0..4));
        assert_eq!(&pixel[..], &expected_pixel(page_number - 1));
    }

    document.destroy().await.unwrap();
    assert_eq!(task.state(), SessionState::Destroyed);
    assert!(transport.is_aborted());
}

#[tokio::test]
async fn test_transport_full_reader_reports_headers() {
    let data = sample_bytes(DOCUMENT_LENGTH);
    let (transport, _requests) = serving_transport(data, 65_536);
    let stream = PDFDataTransportStream::new(transport, false, false);
    let reader = stream.get_full_reader().unwrap();

    reader.headers_ready().await.unwrap();
    assert!(reader.is_range_supported());
    assert!(reader.is_streaming_supported());
    assert_eq!(reader.content_length(), Some(DOCUMENT_LENGTH as u64));

    let range = stream.get_range_reader(131_072, 196_608).unwrap();
    let chunk = range.read().await.unwrap().unwrap();
    assert_eq!(chunk.len(), 65_536);
    assert_eq!(chunk[0], (131_072 % 251) as u8);
}

#[tokio::test]
async fn test_undecodable_dependency_fails_the_render() {
    let worker = PDFWorker::loopback(StripeProvider::with_corrupt_images(3)).unwrap();
    let task = get_document(
        DocumentSource::Data(sample_bytes(1024)),
        DocumentOptions::default(),
        worker,
    );
    let document = task.promise().await.unwrap();

    // Page 1 waits on a page image, page 2 on a document-wide one.
    for page_number in [1, 2] {
        let page = document.get_page(page_number).await.unwrap();
        let target = surface();
        let render = page
            .render(RenderParameters::new(target.clone(), page.get_viewport(1.0, None).unwrap()))
            .unwrap();

        let error = tokio::time::timeout(Duration::from_secs(5), render.promise())
            .await
            .expect("render settles")
            .unwrap_err();
        assert!(matches!(error, PDFError::RenderingError(_)), "{error:?}");
        assert!(!error.is_cancellation());
        assert!(render.is_settled());

        // The surface is free again once the render failed.
        let retry = page
            .render(RenderParameters::new(target, page.get_viewport(1.0, None).unwrap()))
            .unwrap();
        retry.cancel();
    }

    // Pages without image dependencies still render.
    let page = document.get_page(3).await.unwrap();
    let target = surface();
    page.render(RenderParameters::new(target.clone(), page.get_viewport(1.0, None).unwrap()))
        .unwrap()
        .promise()
        .await
        .unwrap();
    let pixel = target.with_device(|device| device.get_image_data().data.slice(0..4));
    assert_eq!(&pixel[..], &expected_pixel(2));

    document.destroy().await.unwrap();
}

#[tokio::test]
async fn test_progress_reaches_document_length() {
    let data = sample_bytes(DOCUMENT_LENGTH);
    let (transport, _requests) = serving_transport(data, 65_536);
    let worker = PDFWorker::loopback(StripeProvider::new(1)).unwrap();
    let task = get_document(
        DocumentSource::RangeTransport(transport),
        DocumentOptions::default(),
        worker,
    );
    let totals = Arc::new(std::sync::Mutex::new(Vec::new()));
    task.on_progress({
        let totals = Arc::clone(&totals);
        move |loaded, total| totals.lock().unwrap().push((loaded, total))
    });

    let document = task.promise().await.unwrap();
    let totals = totals.lock().unwrap().clone();
    for (loaded, total) in totals {
        assert!(loaded <= DOCUMENT_LENGTH as u64);
        assert!(total.is_none_or(|total| total == DOCUMENT_LENGTH as u64));
    }
    document.destroy().await.unwrap();
}

#[tokio::test]
async fn test_surface_in_use_fails_before_any_work() {
    let worker = PDFWorker::loopback(StripeProvider::with_padding(2, 50)).unwrap();
    let task = get_document(
        DocumentSource::Data(sample_bytes(4096)),
        DocumentOptions::default(),
        worker,
    );
    let document = task.promise().await.unwrap();
    let first_page = document.get_page(1).await.unwrap();
    let second_page = document.get_page(2).await.unwrap();
    let shared = surface();

    // Parked: the first slice is never run.
    let first = first_page
        .render(
            RenderParameters::new(shared.clone(), first_page.get_viewport(1.0, None).unwrap())
                .with_on_continue(|_job| {}),
        )
        .unwrap();

    let error = second_page
        .render(RenderParameters::new(
            shared.clone(),
            second_page.get_viewport(1.0, None).unwrap(),
        ))
        .err()
        .unwrap();
    assert!(matches!(error, PDFError::SurfaceInUse));
    assert!(!second_page.is_display_ready(RenderIntent::Display));

    first.cancel();
    assert!(first.promise().await.unwrap_err().is_cancellation());
    document.destroy().await.unwrap();
}

#[tokio::test]
async fn test_cancel_releases_the_surface() {
    let worker = PDFWorker::loopback(StripeProvider::with_padding(1, 50)).unwrap();
    let task = get_document(
        DocumentSource::Data(sample_bytes(4096)),
        DocumentOptions::default(),
        worker,
    );
    let document = task.promise().await.unwrap();
    let page = document.get_page(1).await.unwrap();
    let target = surface();

    let parked = page
        .render(
            RenderParameters::new(target.clone(), page.get_viewport(1.0, None).unwrap())
                .with_on_continue(|_job| {}),
        )
        .unwrap();
    parked.cancel();
    let error = parked.promise().await.unwrap_err();
    assert!(error.is_cancellation());
    assert_eq!(error.message(), "Rendering cancelled, page 1");

    // Cancelling again is a no-op.
    parked.cancel();
    assert!(parked.promise().await.unwrap_err().is_cancellation());

    let retry = page
        .render(RenderParameters::new(target.clone(), page.get_viewport(1.0, None).unwrap()))
        .unwrap();
    retry.promise().await.unwrap();
    let pixel = target.with_device(|device| device.get_image_data().data.slice(0..4));
    assert_eq!(&pixel[..], &expected_pixel(0));

    document.destroy().await.unwrap();
}

#[tokio::test]
async fn test_operator_list_and_text_content() {
    let worker = PDFWorker::loopback(StripeProvider::with_padding(2, 10)).unwrap();
    let task = get_document(
        DocumentSource::Data(sample_bytes(1024)),
        DocumentOptions::default(),
        worker,
    );
    let document = task.promise().await.unwrap();
    let page = document.get_page(2).await.unwrap();

    let list = page.get_operator_list(RenderIntent::Display).await.unwrap();
    assert!(list.last_chunk);
    assert_eq!(list.len(), 10 * 2 + 3);
    assert_eq!(list.op_at(list.len() - 1), Some(OpCode::Fill));

    let text = page.get_text_content(TextContentParams::default()).await.unwrap();
    assert_eq!(text.items.len(), 1);
    assert_eq!(text.items[0].str, "Page 2");

    document.destroy().await.unwrap();
}

#[tokio::test]
async fn test_file_source_session() {
    let data = sample_bytes(100_000);
    let mut file = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut file, &data).unwrap();

    let provider = StripeProvider::new(1);
    let worker = PDFWorker::loopback(provider.clone()).unwrap();
    let task = get_document(
        DocumentSource::File(file.path().to_path_buf()),
        DocumentOptions::default(),
        worker,
    );
    let document = task.promise().await.unwrap();
    assert_eq!(provider.received().unwrap(), data);
    assert_eq!(document.get_data().await.unwrap(), data);
    document.destroy().await.unwrap();
}

#[tokio::test]
async fn test_missing_file_fails_loading() {
    let dir = tempfile::tempdir().unwrap();
    let worker = PDFWorker::loopback(StripeProvider::new(1)).unwrap();
    let task = get_document(
        DocumentSource::File(dir.path().join("missing.pdf")),
        DocumentOptions::default(),
        worker,
    );
    assert!(task.promise().await.is_err());
    assert_eq!(task.state(), SessionState::Failed);
}

#[tokio::test]
async fn test_threaded_worker_session() {
    let worker = PDFWorker::spawn_thread(StripeProvider::new(2)).unwrap();
    let task = get_document(
        DocumentSource::Data(Bytes::from_static(b"%PDF-1.7\n%%EOF")),
        DocumentOptions::default(),
        worker,
    );
    let document = tokio::time::timeout(Duration::from_secs(5), task.promise())
        .await
        .unwrap()
        .unwrap();
    let page = document.get_page(2).await.unwrap();
    let target = surface();
    page.render(RenderParameters::new(target.clone(), page.get_viewport(1.0, None).unwrap()))
        .unwrap()
        .promise()
        .await
        .unwrap();
    let pixel = target.with_device(|device| device.get_image_data().data.slice(0..4));
    assert_eq!(&pixel[..], &expected_pixel(1));
    document.destroy().await.unwrap();
}
